//! Trusted-device unlock.
//!
//! A trusted device holds a random 64-byte device key in the secure tier.
//! The device registry keeps three wraps produced at enrollment:
//!
//! ```text
//! user key     ──RSA-OAEP──▶ device public key
//! device pub   ──AES/HMAC──▶ user key
//! device priv  ──AES/HMAC──▶ device key
//! ```
//!
//! Unlocking reverses the chain: device key opens the device private key,
//! which opens the user key. If either layer fails the local device key is
//! discarded, since it no longer matches what the server holds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vaultkey_core::config::DeviceConfig;
use vaultkey_core::{UserId, VaultKeyError, VaultKeyResult};
use vaultkey_crypto::{
    decrypt_to_bytes, encrypt, generate_key, generate_key_pair, rsa_decrypt, rsa_encrypt,
    DeviceKey, EncString, SymmetricCryptoKey, UserKey, STRETCHED_KEY_SIZE,
};

use crate::hierarchy::KeyService;
use crate::state::{keys, StorageLocation};

/// Keys uploaded to the device registry when a device becomes trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDeviceKeysRequest {
    /// User key RSA-wrapped to the device public key
    pub encrypted_user_key: EncString,
    /// Device public key encrypted under the user key
    pub encrypted_public_key: EncString,
    /// Device private key encrypted under the device key
    pub encrypted_private_key: EncString,
}

/// Device record returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub id: String,
    pub name: String,
    pub identifier: String,
    #[serde(rename = "type")]
    pub device_type: u8,
    pub creation_date: String,
}

/// Remote registry of trusted devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn update_trusted_device_keys(
        &self,
        device_identifier: &str,
        request: &TrustedDeviceKeysRequest,
    ) -> VaultKeyResult<DeviceResponse>;
}

pub struct DeviceTrustService {
    keys: Arc<KeyService>,
    registry: Arc<dyn DeviceRegistry>,
    identifier: Option<String>,
}

impl DeviceTrustService {
    pub fn new(keys: Arc<KeyService>, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            keys,
            registry,
            identifier: None,
        }
    }

    pub fn from_config(
        keys: Arc<KeyService>,
        registry: Arc<dyn DeviceRegistry>,
        config: &DeviceConfig,
    ) -> Self {
        Self {
            keys,
            registry,
            identifier: config.identifier.clone(),
        }
    }

    /// Configured device identifier, or a generated one persisted globally.
    pub async fn device_identifier(&self) -> VaultKeyResult<String> {
        if let Some(id) = &self.identifier {
            return Ok(id.clone());
        }
        let storage = self.keys.storage();
        let location = StorageLocation::global();
        if let Some(id) = storage.get(&location, keys::APP_ID).await? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        storage.set(&location, keys::APP_ID, &id).await?;
        tracing::info!(identifier = %id, "generated device identifier");
        Ok(id)
    }

    pub async fn should_trust_device(&self, user: &UserId) -> VaultKeyResult<bool> {
        Ok(self
            .keys
            .storage()
            .get_parsed::<bool>(&StorageLocation::disk(user), keys::SHOULD_TRUST_DEVICE)
            .await?
            .unwrap_or(false))
    }

    pub async fn set_should_trust_device(&self, user: &UserId, value: bool) -> VaultKeyResult<()> {
        self.keys
            .storage()
            .set(
                &StorageLocation::disk(user),
                keys::SHOULD_TRUST_DEVICE,
                &value.to_string(),
            )
            .await
    }

    /// Trust this device if the user asked for it at login. The choice is
    /// consumed either way.
    pub async fn trust_device_if_required(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<Option<DeviceResponse>> {
        if !self.should_trust_device(user).await? {
            return Ok(None);
        }
        self.set_should_trust_device(user, false).await?;
        self.trust_device(user).await.map(Some)
    }

    /// Enroll this device. The device key is stored only after the registry
    /// accepted all three wraps.
    ///
    /// The device public key wraps all 64 bytes of the user key (enc and MAC
    /// halves). Registrations written by clients that wrap only the 32-byte
    /// enc half do not unwrap to a usable key here, and such a device falls
    /// back to untrusted.
    pub async fn trust_device(&self, user: &UserId) -> VaultKeyResult<DeviceResponse> {
        let user_key = self
            .keys
            .user_key(user)
            .await
            .ok_or(VaultKeyError::NoUserKey)?;

        let device_key = DeviceKey::new(generate_key(STRETCHED_KEY_SIZE)?);
        let pair = tokio::task::spawn_blocking(generate_key_pair)
            .await
            .map_err(|e| VaultKeyError::Crypto(format!("key pair task: {e}")))??;

        let request = TrustedDeviceKeysRequest {
            encrypted_user_key: rsa_encrypt(user_key.key().as_bytes(), &pair.public_key)?,
            encrypted_public_key: encrypt(&pair.public_key, user_key.key())?,
            encrypted_private_key: encrypt(&pair.private_key, device_key.key())?,
        };

        let identifier = self.device_identifier().await?;
        let response = self
            .registry
            .update_trusted_device_keys(&identifier, &request)
            .await?;

        self.set_device_key(user, &device_key).await?;
        tracing::info!(user = %user, device = %response.id, "device trusted");
        Ok(response)
    }

    pub async fn device_key(&self, user: &UserId) -> VaultKeyResult<Option<DeviceKey>> {
        match self
            .keys
            .storage()
            .get(&StorageLocation::secure(user), keys::DEVICE_KEY)
            .await?
        {
            Some(encoded) => Ok(Some(DeviceKey::new(SymmetricCryptoKey::from_b64(&encoded)?))),
            None => Ok(None),
        }
    }

    async fn set_device_key(&self, user: &UserId, key: &DeviceKey) -> VaultKeyResult<()> {
        let encoded = key.key().key_b64();
        self.keys
            .storage()
            .set(&StorageLocation::secure(user), keys::DEVICE_KEY, &encoded)
            .await
    }

    pub async fn clear_device_key(&self, user: &UserId) -> VaultKeyResult<()> {
        self.keys
            .storage()
            .remove(&StorageLocation::secure(user), keys::DEVICE_KEY)
            .await
    }

    /// Recover the user key from the registry's wraps.
    ///
    /// Returns `Ok(None)` when this device holds no device key. When the
    /// wraps do not open, the stored device key is deleted and `Ok(None)`
    /// returned.
    pub async fn decrypt_user_key_with_device_key(
        &self,
        user: &UserId,
        encrypted_device_private_key: &EncString,
        encrypted_user_key: &EncString,
        device_key: Option<DeviceKey>,
    ) -> VaultKeyResult<Option<UserKey>> {
        let device_key = match device_key {
            Some(key) => key,
            None => match self.device_key(user).await? {
                Some(key) => key,
                None => return Ok(None),
            },
        };

        match open_user_key(&device_key, encrypted_device_private_key, encrypted_user_key) {
            Ok(user_key) => Ok(Some(user_key)),
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "device key no longer valid, removing it");
                self.clear_device_key(user).await?;
                Ok(None)
            }
        }
    }

    /// Unlock the account through device trust. Returns `false` when the
    /// device is not (or no longer) trusted.
    pub async fn unlock_with_device_key(
        &self,
        user: &UserId,
        encrypted_device_private_key: &EncString,
        encrypted_user_key: &EncString,
    ) -> VaultKeyResult<bool> {
        match self
            .decrypt_user_key_with_device_key(
                user,
                encrypted_device_private_key,
                encrypted_user_key,
                None,
            )
            .await?
        {
            Some(user_key) => {
                self.keys.unlock_with_user_key(user, user_key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn open_user_key(
    device_key: &DeviceKey,
    encrypted_device_private_key: &EncString,
    encrypted_user_key: &EncString,
) -> VaultKeyResult<UserKey> {
    let device_private_key = decrypt_to_bytes(encrypted_device_private_key, device_key.key())?;
    let raw = rsa_decrypt(encrypted_user_key, &device_private_key)?;
    if raw.len() != STRETCHED_KEY_SIZE {
        return Err(VaultKeyError::InvalidKeyMaterial(format!(
            "device-wrapped user key is {} bytes, expected {STRETCHED_KEY_SIZE}",
            raw.len()
        )));
    }
    Ok(UserKey::new(SymmetricCryptoKey::from_bytes(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Storage;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, TrustedDeviceKeysRequest)>>,
    }

    #[async_trait]
    impl DeviceRegistry for Recorder {
        async fn update_trusted_device_keys(
            &self,
            device_identifier: &str,
            request: &TrustedDeviceKeysRequest,
        ) -> VaultKeyResult<DeviceResponse> {
            self.calls
                .lock()
                .await
                .push((device_identifier.to_string(), request.clone()));
            Ok(DeviceResponse {
                id: "dev-1".into(),
                name: "laptop".into(),
                identifier: device_identifier.to_string(),
                device_type: 8,
                creation_date: "2024-01-01T00:00:00Z".into(),
            })
        }
    }

    #[test]
    fn test_request_wire_names() {
        let enc: EncString = "4.AAAA".parse().unwrap();
        let request = TrustedDeviceKeysRequest {
            encrypted_user_key: enc.clone(),
            encrypted_public_key: enc.clone(),
            encrypted_private_key: enc,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("encryptedUserKey").is_some());
        assert!(json.get("encryptedPublicKey").is_some());
        assert!(json.get("encryptedPrivateKey").is_some());
    }

    #[tokio::test]
    async fn test_generated_identifier_is_stable() {
        let keys = Arc::new(KeyService::new(Storage::in_memory()));
        let trust = DeviceTrustService::new(keys, Arc::new(Recorder::default()));
        let first = trust.device_identifier().await.unwrap();
        assert_eq!(trust.device_identifier().await.unwrap(), first);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn test_trust_device_round_trip() {
        let keys = Arc::new(KeyService::new(Storage::in_memory()));
        let registry = Arc::new(Recorder::default());
        let config = DeviceConfig {
            identifier: Some("device-abc".into()),
            name: None,
        };
        let trust = DeviceTrustService::from_config(keys.clone(), registry.clone(), &config);
        let user = UserId::from("u1");

        let err = trust.trust_device(&user).await.unwrap_err();
        assert!(matches!(err, VaultKeyError::NoUserKey));
        assert!(trust.device_key(&user).await.unwrap().is_none());

        let user_key = UserKey::new(generate_key(64).unwrap());
        keys.set_user_key(&user, user_key.clone()).await.unwrap();
        let response = trust.trust_device(&user).await.unwrap();
        assert_eq!(response.identifier, "device-abc");
        assert!(trust.device_key(&user).await.unwrap().is_some());

        let calls = registry.calls.lock().await;
        let (_, request) = &calls[0];
        let opened = trust
            .decrypt_user_key_with_device_key(
                &user,
                &request.encrypted_private_key,
                &request.encrypted_user_key,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.key(), user_key.key());
    }

    #[tokio::test]
    async fn test_enc_half_wrap_falls_back_to_untrusted() {
        let keys = Arc::new(KeyService::new(Storage::in_memory()));
        let trust = DeviceTrustService::new(keys, Arc::new(Recorder::default()));
        let user = UserId::from("u3");

        let device_key = DeviceKey::new(generate_key(64).unwrap());
        trust.set_device_key(&user, &device_key).await.unwrap();
        let pair = generate_key_pair().unwrap();
        let user_key = generate_key(64).unwrap();
        let encrypted_private_key = encrypt(&pair.private_key, device_key.key()).unwrap();
        let enc_half_only = rsa_encrypt(&user_key.as_bytes()[..32], &pair.public_key).unwrap();

        let opened = trust
            .decrypt_user_key_with_device_key(&user, &encrypted_private_key, &enc_half_only, None)
            .await
            .unwrap();
        assert!(opened.is_none());
        assert!(trust.device_key(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_trust_device_is_consumed() {
        let keys = Arc::new(KeyService::new(Storage::in_memory()));
        let registry = Arc::new(Recorder::default());
        let trust = DeviceTrustService::new(keys.clone(), registry.clone());
        let user = UserId::from("u2");
        keys.set_user_key(&user, UserKey::new(generate_key(64).unwrap()))
            .await
            .unwrap();

        assert!(trust.trust_device_if_required(&user).await.unwrap().is_none());
        trust.set_should_trust_device(&user, true).await.unwrap();
        assert!(trust.trust_device_if_required(&user).await.unwrap().is_some());
        assert!(!trust.should_trust_device(&user).await.unwrap());
        assert_eq!(registry.calls.lock().await.len(), 1);
    }
}
