//! Item encryption through the key hierarchy: personal, organization and
//! legacy (master-key-only) accounts.

use std::sync::Arc;

use vaultkey_core::{OrganizationId, UserId, VaultKeyError};
use vaultkey_crypto::{generate_key, rsa_encrypt, MasterKey, UserKey};
use vaultkey_keys::{KeyService, ProfileOrganization, Storage};
use vaultkey_vault::{
    CipherService, CipherView, CipherViewData, Fido2KeyView, FolderService, FolderView,
    LoginView, DECRYPT_ERROR_NAME,
};

async fn member_of(org: &str) -> (Arc<KeyService>, UserId) {
    let keys = Arc::new(KeyService::new(Storage::in_memory()));
    let user = UserId::from("member");
    let user_key = UserKey::new(generate_key(64).unwrap());
    keys.unlock_with_user_key(&user, user_key.clone()).await.unwrap();

    let (public_key, encrypted_private) = KeyService::make_key_pair(user_key.key()).await.unwrap();
    keys.set_private_key(&user, &encrypted_private).await.unwrap();
    keys.set_org_keys(
        &user,
        &[ProfileOrganization {
            id: OrganizationId::from(org),
            key: rsa_encrypt(generate_key(64).unwrap().as_bytes(), &public_key).unwrap(),
        }],
        &[],
    )
    .await
    .unwrap();
    (keys, user)
}

fn login(name: &str, username: &str) -> CipherView {
    CipherView::new(
        name,
        CipherViewData::Login(LoginView {
            username: Some(username.into()),
            password: Some("hunter2".into()),
            ..Default::default()
        }),
    )
}

#[tokio::test]
async fn org_items_use_org_key() {
    let (keys, user) = member_of("acme").await;
    let ciphers = CipherService::new(keys.clone());

    let mut view = login("Shared", "ops");
    view.organization_id = Some(OrganizationId::from("acme"));
    let cipher = ciphers.encrypt(&user, view.clone(), None, None).await.unwrap();

    let org_key = keys
        .org_key(&user, &OrganizationId::from("acme"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cipher.decrypt(org_key.key()).unwrap(), view);
    assert!(cipher
        .decrypt(&keys.encryption_key(&user).await.unwrap())
        .is_err());
}

#[tokio::test]
async fn unknown_org_is_an_error_on_encrypt_and_a_placeholder_on_decrypt() {
    let (keys, user) = member_of("acme").await;
    let ciphers = CipherService::new(keys.clone());

    let mut view = login("Elsewhere", "x");
    view.organization_id = Some(OrganizationId::from("other"));
    let err = ciphers
        .encrypt(&user, view.clone(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultKeyError::NoOrganizationKey(id) if id == "other"));

    // Encrypted elsewhere with a key this account does not hold.
    let foreign = view.encrypt(&generate_key(64).unwrap()).unwrap();
    let personal = ciphers
        .encrypt(&user, login("Mine", "me"), None, None)
        .await
        .unwrap();

    let views = ciphers.decrypt_all(&user, &[foreign, personal]).await;
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].name, DECRYPT_ERROR_NAME);
    assert!(views[0].decryption_failed);
    assert!(matches!(views[0].data, CipherViewData::Login(_)));
    assert_eq!(views[1].name, "Mine");
}

#[tokio::test]
async fn batch_sorts_by_name_then_username() {
    let (keys, user) = member_of("acme").await;
    let ciphers = CipherService::new(keys);
    let mut batch = Vec::new();
    for (name, username) in [("bank", "zed"), ("Bank", "amy"), ("alpha", "x")] {
        batch.push(
            ciphers
                .encrypt(&user, login(name, username), None, None)
                .await
                .unwrap(),
        );
    }

    let order: Vec<(String, String)> = ciphers
        .decrypt_all(&user, &batch)
        .await
        .into_iter()
        .map(|v| {
            let username = v.login().and_then(|l| l.username.clone()).unwrap_or_default();
            (v.name, username)
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("alpha".to_string(), "x".to_string()),
            ("Bank".to_string(), "amy".to_string()),
            ("bank".to_string(), "zed".to_string()),
        ]
    );
}

#[tokio::test]
async fn re_encrypting_tracks_password_history() {
    let (keys, user) = member_of("acme").await;
    let ciphers = CipherService::new(keys);

    let mut view = login("Site", "jane");
    view.id = Some("c1".into());
    let stored = ciphers.encrypt(&user, view.clone(), None, None).await.unwrap();

    if let CipherViewData::Login(l) = &mut view.data {
        l.password = Some("correct horse".into());
    }
    let updated = ciphers
        .encrypt(&user, view, None, Some(&stored))
        .await
        .unwrap();

    let decrypted = ciphers.decrypt(&user, &updated).await.unwrap();
    assert_eq!(decrypted.password_history.len(), 1);
    assert_eq!(decrypted.password_history[0].password, "hunter2");
    assert!(decrypted.login().unwrap().password_revision_date.is_some());
}

#[tokio::test]
async fn passkeys_are_encrypted_with_their_login() {
    let (keys, user) = member_of("acme").await;
    let ciphers = CipherService::new(keys);

    let passkey = Fido2KeyView {
        rp_id: "webauthn.io".into(),
        key_value: "MIGHAgEAMBMGByqGSM49".into(),
        counter: 3,
        discoverable: true,
        ..Default::default()
    };
    let view = CipherView::new(
        "webauthn.io",
        CipherViewData::Login(LoginView {
            fido2_keys: vec![passkey.clone()],
            ..Default::default()
        }),
    );
    let cipher = ciphers.encrypt(&user, view, None, None).await.unwrap();
    let back = ciphers.decrypt(&user, &cipher).await.unwrap();
    assert_eq!(back.login().unwrap().fido2_keys, vec![passkey]);
}

#[tokio::test]
async fn legacy_account_encrypts_with_master_key() {
    let keys = Arc::new(KeyService::new(Storage::in_memory()));
    let user = UserId::from("legacy");
    keys.set_master_key(&user, MasterKey::new(generate_key(32).unwrap()))
        .await;

    let folders = FolderService::new(keys);
    let folder = folders
        .encrypt(&user, &FolderView::new("Old"), None)
        .await
        .unwrap();
    assert_eq!(
        folder.name.encryption_type(),
        vaultkey_crypto::EncryptionType::AesCbc256B64
    );
    assert_eq!(folders.decrypt(&user, &folder).await.unwrap().name, "Old");
}

#[tokio::test]
async fn cipher_json_shape() {
    let key = generate_key(64).unwrap();
    let cipher = login("Site", "jane").encrypt(&key).unwrap();
    let json = serde_json::to_value(&cipher).unwrap();
    assert_eq!(json["type"], "login");
    assert!(json["username"].is_string());

    let back: vaultkey_vault::Cipher = serde_json::from_value(json).unwrap();
    assert_eq!(back, cipher);
}
