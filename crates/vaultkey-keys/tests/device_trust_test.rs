//! Trusted-device enrollment and unlock against an in-memory registry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use vaultkey_core::{UnlockState, UserId, VaultKeyError, VaultKeyResult};
use vaultkey_crypto::{encrypt, generate_key, DeviceKey, UserKey};
use vaultkey_keys::{
    DeviceRegistry, DeviceResponse, DeviceTrustService, KeyService, Storage,
    TrustedDeviceKeysRequest,
};

/// Registry double that keeps the last upload, or refuses every upload.
#[derive(Default)]
struct FakeRegistry {
    last: Mutex<Option<TrustedDeviceKeysRequest>>,
    reject: bool,
}

#[async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn update_trusted_device_keys(
        &self,
        device_identifier: &str,
        request: &TrustedDeviceKeysRequest,
    ) -> VaultKeyResult<DeviceResponse> {
        if self.reject {
            return Err(VaultKeyError::Registry("device not found".into()));
        }
        *self.last.lock().await = Some(request.clone());
        Ok(DeviceResponse {
            id: "d1".into(),
            name: "test device".into(),
            identifier: device_identifier.to_string(),
            device_type: 14,
            creation_date: "2024-05-01T12:00:00Z".into(),
        })
    }
}

async fn setup(reject: bool) -> (Arc<KeyService>, Arc<FakeRegistry>, DeviceTrustService, UserId) {
    let keys = Arc::new(KeyService::new(Storage::in_memory()));
    let registry = Arc::new(FakeRegistry {
        reject,
        ..Default::default()
    });
    let trust = DeviceTrustService::new(keys.clone(), registry.clone());
    let user = UserId::from("device-user");
    keys.set_user_key(&user, UserKey::new(generate_key(64).unwrap()))
        .await
        .unwrap();
    (keys, registry, trust, user)
}

#[tokio::test]
async fn untrusted_device_yields_none() {
    let (_, _, trust, user) = setup(false).await;
    let enc = encrypt(b"x", &generate_key(64).unwrap()).unwrap();
    let out = trust
        .decrypt_user_key_with_device_key(&user, &enc, &enc, None)
        .await
        .unwrap();
    assert!(out.is_none());
}

#[tokio::test]
async fn registry_failure_stores_no_device_key() {
    let (_, _, trust, user) = setup(true).await;
    let err = trust.trust_device(&user).await.unwrap_err();
    assert!(matches!(err, VaultKeyError::Registry(_)));
    assert!(trust.device_key(&user).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_unwrap_revokes_stored_device_key() {
    let (_, registry, trust, user) = setup(false).await;
    trust.trust_device(&user).await.unwrap();
    assert!(trust.device_key(&user).await.unwrap().is_some());

    let request = registry.last.lock().await.clone().unwrap();
    // A user key blob the device private key cannot open.
    let foreign = encrypt(b"not an rsa payload", &generate_key(64).unwrap()).unwrap();

    let out = trust
        .decrypt_user_key_with_device_key(&user, &request.encrypted_private_key, &foreign, None)
        .await
        .unwrap();
    assert!(out.is_none());
    assert!(trust.device_key(&user).await.unwrap().is_none());
}

#[tokio::test]
async fn wrong_device_key_revokes_stored_device_key() {
    let (_, registry, trust, user) = setup(false).await;
    trust.trust_device(&user).await.unwrap();
    let request = registry.last.lock().await.clone().unwrap();

    let other = DeviceKey::new(generate_key(64).unwrap());
    let out = trust
        .decrypt_user_key_with_device_key(
            &user,
            &request.encrypted_private_key,
            &request.encrypted_user_key,
            Some(other),
        )
        .await
        .unwrap();
    assert!(out.is_none());
    assert!(trust.device_key(&user).await.unwrap().is_none());
}

#[tokio::test]
async fn trusted_device_unlocks_after_lock() {
    let (keys, registry, trust, user) = setup(false).await;
    let original = keys.user_key(&user).await.unwrap();
    trust.trust_device(&user).await.unwrap();
    let request = registry.last.lock().await.clone().unwrap();

    keys.lock(&user).await;
    assert_eq!(keys.unlock_state(&user).await, UnlockState::Locked);

    assert!(trust
        .unlock_with_device_key(
            &user,
            &request.encrypted_private_key,
            &request.encrypted_user_key
        )
        .await
        .unwrap());
    assert_eq!(keys.unlock_state(&user).await, UnlockState::Unlocked);
    assert_eq!(keys.user_key(&user).await.unwrap().key(), original.key());
}
