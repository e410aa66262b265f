//! Vault item (cipher) encryption.
//!
//! Items owned by an organization are encrypted under that organization's
//! key; personal items under the account encryption key.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultkey_core::{OrganizationId, UserId, VaultKeyError, VaultKeyResult};
use vaultkey_crypto::{decrypt_to_string, encrypt_str, EncString, SymmetricCryptoKey};
use vaultkey_keys::KeyService;

use crate::envelope::{decrypt_opt, encrypt_opt, DECRYPT_ERROR_NAME};
use crate::fido2::{Fido2Key, Fido2KeyView};

/// Password history entries kept per item.
pub const MAX_PASSWORD_HISTORY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    #[default]
    Text,
    Hidden,
    Boolean,
    Linked,
}

encrypted_record!(
    /// Payment card details.
    Card => CardView {
        cardholder_name,
        brand,
        number,
        exp_month,
        exp_year,
        code,
    }
);

encrypted_record!(
    /// Personal identity details.
    Identity => IdentityView {
        title,
        first_name,
        middle_name,
        last_name,
        address1,
        address2,
        address3,
        city,
        state,
        postal_code,
        country,
        company,
        email,
        phone,
        ssn,
        username,
        passport_number,
        license_number,
    }
);

encrypted_record!(
    LoginUri => LoginUriView { uri }
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Login {
    #[serde(default)]
    pub username: Option<EncString>,
    #[serde(default)]
    pub password: Option<EncString>,
    #[serde(default)]
    pub password_revision_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub totp: Option<EncString>,
    #[serde(default)]
    pub uris: Vec<LoginUri>,
    #[serde(default)]
    pub fido2_keys: Vec<Fido2Key>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginView {
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_revision_date: Option<DateTime<Utc>>,
    pub totp: Option<String>,
    pub uris: Vec<LoginUriView>,
    pub fido2_keys: Vec<Fido2KeyView>,
}

impl LoginView {
    fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<Login> {
        Ok(Login {
            username: encrypt_opt(self.username.as_deref(), key)?,
            password: encrypt_opt(self.password.as_deref(), key)?,
            password_revision_date: self.password_revision_date,
            totp: encrypt_opt(self.totp.as_deref(), key)?,
            uris: self
                .uris
                .iter()
                .map(|u| u.encrypt(key))
                .collect::<VaultKeyResult<_>>()?,
            fido2_keys: self
                .fido2_keys
                .iter()
                .map(|k| k.encrypt(key))
                .collect::<VaultKeyResult<_>>()?,
        })
    }
}

impl Login {
    fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<LoginView> {
        Ok(LoginView {
            username: decrypt_opt(self.username.as_ref(), key)?,
            password: decrypt_opt(self.password.as_ref(), key)?,
            password_revision_date: self.password_revision_date,
            totp: decrypt_opt(self.totp.as_ref(), key)?,
            uris: self
                .uris
                .iter()
                .map(|u| u.decrypt(key))
                .collect::<VaultKeyResult<_>>()?,
            fido2_keys: self
                .fido2_keys
                .iter()
                .map(|k| k.decrypt(key))
                .collect::<VaultKeyResult<_>>()?,
        })
    }
}

/// Type-specific payload of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CipherData {
    Login(Login),
    SecureNote,
    Card(Card),
    Identity(Identity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherViewData {
    Login(LoginView),
    SecureNote,
    Card(CardView),
    Identity(IdentityView),
}

impl Default for CipherViewData {
    fn default() -> Self {
        Self::Login(LoginView::default())
    }
}

impl CipherViewData {
    fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<CipherData> {
        Ok(match self {
            Self::Login(login) => CipherData::Login(login.encrypt(key)?),
            Self::SecureNote => CipherData::SecureNote,
            Self::Card(card) => CipherData::Card(card.encrypt(key)?),
            Self::Identity(identity) => CipherData::Identity(identity.encrypt(key)?),
        })
    }

    fn login(&self) -> Option<&LoginView> {
        match self {
            Self::Login(login) => Some(login),
            _ => None,
        }
    }
}

impl CipherData {
    fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<CipherViewData> {
        Ok(match self {
            Self::Login(login) => CipherViewData::Login(login.decrypt(key)?),
            Self::SecureNote => CipherViewData::SecureNote,
            Self::Card(card) => CipherViewData::Card(card.decrypt(key)?),
            Self::Identity(identity) => CipherViewData::Identity(identity.decrypt(key)?),
        })
    }

    /// Empty view of the same item type.
    fn empty_view(&self) -> CipherViewData {
        match self {
            Self::Login(_) => CipherViewData::Login(LoginView::default()),
            Self::SecureNote => CipherViewData::SecureNote,
            Self::Card(_) => CipherViewData::Card(CardView::default()),
            Self::Identity(_) => CipherViewData::Identity(IdentityView::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(default)]
    pub name: Option<EncString>,
    #[serde(default)]
    pub value: Option<EncString>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldView {
    pub name: Option<String>,
    pub value: Option<String>,
    pub field_type: FieldType,
}

impl FieldView {
    pub fn hidden(name: &str, value: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
            field_type: FieldType::Hidden,
        }
    }

    fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<Field> {
        Ok(Field {
            name: encrypt_opt(self.name.as_deref(), key)?,
            value: encrypt_opt(self.value.as_deref(), key)?,
            field_type: self.field_type,
        })
    }
}

impl Field {
    fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<FieldView> {
        Ok(FieldView {
            name: decrypt_opt(self.name.as_ref(), key)?,
            value: decrypt_opt(self.value.as_ref(), key)?,
            field_type: self.field_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordHistory {
    pub password: EncString,
    pub last_used_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHistoryView {
    pub password: String,
    pub last_used_date: DateTime<Utc>,
}

/// Encrypted vault item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cipher {
    pub id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub name: EncString,
    #[serde(default)]
    pub notes: Option<EncString>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub reprompt: bool,
    #[serde(flatten)]
    pub data: CipherData,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub password_history: Vec<PasswordHistory>,
    pub revision_date: DateTime<Utc>,
}

/// Decrypted vault item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherView {
    pub id: Option<String>,
    pub organization_id: Option<OrganizationId>,
    pub folder_id: Option<String>,
    pub name: String,
    pub notes: Option<String>,
    pub favorite: bool,
    pub reprompt: bool,
    pub data: CipherViewData,
    pub fields: Vec<FieldView>,
    pub password_history: Vec<PasswordHistoryView>,
    pub revision_date: DateTime<Utc>,
    /// Set on placeholder views for items that could not be decrypted
    pub decryption_failed: bool,
}

impl CipherView {
    pub fn new(name: impl Into<String>, data: CipherViewData) -> Self {
        Self {
            id: None,
            organization_id: None,
            folder_id: None,
            name: name.into(),
            notes: None,
            favorite: false,
            reprompt: false,
            data,
            fields: Vec::new(),
            password_history: Vec::new(),
            revision_date: Utc::now(),
            decryption_failed: false,
        }
    }

    pub fn login(&self) -> Option<&LoginView> {
        self.data.login()
    }

    fn decryption_error(cipher: &Cipher) -> Self {
        Self {
            id: cipher.id.clone(),
            organization_id: cipher.organization_id.clone(),
            folder_id: cipher.folder_id.clone(),
            name: DECRYPT_ERROR_NAME.to_string(),
            notes: None,
            favorite: cipher.favorite,
            reprompt: cipher.reprompt,
            data: cipher.data.empty_view(),
            fields: Vec::new(),
            password_history: Vec::new(),
            revision_date: cipher.revision_date,
            decryption_failed: true,
        }
    }

    /// Encrypt under `key`. Pure; history bookkeeping happens in
    /// [`CipherService::encrypt`].
    pub fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<Cipher> {
        Ok(Cipher {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            folder_id: self.folder_id.clone(),
            name: encrypt_str(&self.name, key)?,
            notes: encrypt_opt(self.notes.as_deref(), key)?,
            favorite: self.favorite,
            reprompt: self.reprompt,
            data: self.data.encrypt(key)?,
            fields: self
                .fields
                .iter()
                .map(|f| f.encrypt(key))
                .collect::<VaultKeyResult<_>>()?,
            password_history: self
                .password_history
                .iter()
                .map(|h| {
                    Ok(PasswordHistory {
                        password: encrypt_str(&h.password, key)?,
                        last_used_date: h.last_used_date,
                    })
                })
                .collect::<VaultKeyResult<_>>()?,
            revision_date: self.revision_date,
        })
    }
}

impl Cipher {
    pub fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<CipherView> {
        Ok(CipherView {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            folder_id: self.folder_id.clone(),
            name: decrypt_to_string(&self.name, key)?,
            notes: decrypt_opt(self.notes.as_ref(), key)?,
            favorite: self.favorite,
            reprompt: self.reprompt,
            data: self.data.decrypt(key)?,
            fields: self
                .fields
                .iter()
                .map(|f| f.decrypt(key))
                .collect::<VaultKeyResult<_>>()?,
            password_history: self
                .password_history
                .iter()
                .map(|h| {
                    Ok(PasswordHistoryView {
                        password: decrypt_to_string(&h.password, key)?,
                        last_used_date: h.last_used_date,
                    })
                })
                .collect::<VaultKeyResult<_>>()?,
            revision_date: self.revision_date,
            decryption_failed: false,
        })
    }
}

/// Carry the history of `existing` into `updated`.
///
/// A changed login password and any hidden field that was removed or whose
/// value changed are pushed to the front of the history, which is then
/// capped at [`MAX_PASSWORD_HISTORY`] entries.
pub fn update_password_history(updated: &mut CipherView, existing: &CipherView, now: DateTime<Utc>) {
    let mut history = existing.password_history.clone();

    if let (CipherViewData::Login(new_login), Some(old_login)) = (&mut updated.data, existing.login()) {
        match old_login.password.as_deref() {
            Some(old) if !old.is_empty() && new_login.password.as_deref() != Some(old) => {
                history.insert(
                    0,
                    PasswordHistoryView {
                        password: old.to_string(),
                        last_used_date: now,
                    },
                );
                new_login.password_revision_date = Some(now);
            }
            _ => new_login.password_revision_date = old_login.password_revision_date,
        }
    }

    for old in existing.fields.iter().filter(|f| f.field_type == FieldType::Hidden) {
        let (Some(name), Some(value)) = (old.name.as_deref(), old.value.as_deref()) else {
            continue;
        };
        if name.is_empty() || value.is_empty() {
            continue;
        }
        let still_there = updated.fields.iter().any(|f| {
            f.field_type == FieldType::Hidden
                && f.name.as_deref() == Some(name)
                && f.value.as_deref() == Some(value)
        });
        if !still_there {
            history.insert(
                0,
                PasswordHistoryView {
                    password: format!("{name}: {value}"),
                    last_used_date: now,
                },
            );
        }
    }

    history.truncate(MAX_PASSWORD_HISTORY);
    updated.password_history = history;
}

pub struct CipherService {
    keys: Arc<KeyService>,
}

impl CipherService {
    pub fn new(keys: Arc<KeyService>) -> Self {
        Self { keys }
    }

    /// Key for an item: its organization's key, or the account key.
    pub async fn key_for(
        &self,
        user: &UserId,
        organization_id: Option<&OrganizationId>,
    ) -> VaultKeyResult<SymmetricCryptoKey> {
        match organization_id {
            Some(org_id) => self
                .keys
                .org_key(user, org_id)
                .await?
                .map(|k| k.into_inner())
                .ok_or_else(|| VaultKeyError::NoOrganizationKey(org_id.to_string())),
            None => self.keys.encryption_key(user).await,
        }
    }

    /// Encrypt an item. When `original` is the stored version of the same
    /// item, its password history is carried forward and updated.
    pub async fn encrypt(
        &self,
        user: &UserId,
        mut view: CipherView,
        key: Option<&SymmetricCryptoKey>,
        original: Option<&Cipher>,
    ) -> VaultKeyResult<Cipher> {
        if view.id.is_some() {
            if let Some(original) = original {
                let existing = self.decrypt(user, original).await?;
                update_password_history(&mut view, &existing, Utc::now());
            }
        }

        match key {
            Some(key) => view.encrypt(key),
            None => {
                let key = self.key_for(user, view.organization_id.as_ref()).await?;
                view.encrypt(&key)
            }
        }
    }

    pub async fn decrypt(&self, user: &UserId, cipher: &Cipher) -> VaultKeyResult<CipherView> {
        let key = self.key_for(user, cipher.organization_id.as_ref()).await?;
        cipher.decrypt(&key)
    }

    /// Decrypt a batch. A missing key or a bad envelope turns that item into
    /// a placeholder view; the batch itself never fails. Sorted by name, then
    /// by username for logins.
    pub async fn decrypt_all(&self, user: &UserId, ciphers: &[Cipher]) -> Vec<CipherView> {
        let mut keys: HashMap<Option<OrganizationId>, Option<SymmetricCryptoKey>> = HashMap::new();
        let mut views = Vec::with_capacity(ciphers.len());

        for cipher in ciphers {
            if !keys.contains_key(&cipher.organization_id) {
                let key = match self.key_for(user, cipher.organization_id.as_ref()).await {
                    Ok(key) => Some(key),
                    Err(e) => {
                        tracing::warn!(user = %user, org = ?cipher.organization_id, error = %e, "no key for items");
                        None
                    }
                };
                keys.insert(cipher.organization_id.clone(), key);
            }

            let view = match keys.get(&cipher.organization_id).and_then(Option::as_ref) {
                Some(key) => cipher.decrypt(key).unwrap_or_else(|e| {
                    tracing::warn!(user = %user, cipher = ?cipher.id, error = %e, "item decrypt failed");
                    CipherView::decryption_error(cipher)
                }),
                None => CipherView::decryption_error(cipher),
            };
            views.push(view);
        }

        views.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        views
    }
}

fn sort_key(view: &CipherView) -> (String, String) {
    let username = view
        .login()
        .and_then(|l| l.username.as_deref())
        .unwrap_or_default()
        .to_lowercase();
    (view.name.to_lowercase(), username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultkey_crypto::generate_key;

    fn login(name: &str, username: &str, password: &str) -> CipherView {
        CipherView::new(
            name,
            CipherViewData::Login(LoginView {
                username: Some(username.into()),
                password: Some(password.into()),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_round_trip_all_types() {
        let key = generate_key(64).unwrap();
        let mut card = CipherView::new(
            "Visa",
            CipherViewData::Card(CardView {
                cardholder_name: Some("J Doe".into()),
                number: Some("4111111111111111".into()),
                code: Some("123".into()),
                ..Default::default()
            }),
        );
        card.notes = Some("backup card".into());
        card.fields.push(FieldView::hidden("pin", "0000"));

        let identity = CipherView::new(
            "Me",
            CipherViewData::Identity(IdentityView {
                first_name: Some("Jane".into()),
                email: Some("jane@example.com".into()),
                ..Default::default()
            }),
        );
        let note = CipherView::new("Note", CipherViewData::SecureNote);
        let site = login("Site", "jane", "pw");

        for view in [card, identity, note, site] {
            let cipher = view.encrypt(&key).unwrap();
            assert_eq!(cipher.decrypt(&key).unwrap(), view);
        }
    }

    #[test]
    fn test_changed_password_moves_to_history() {
        let now = Utc::now();
        let existing = login("Site", "jane", "old");
        let mut updated = login("Site", "jane", "new");

        update_password_history(&mut updated, &existing, now);

        assert_eq!(updated.password_history.len(), 1);
        assert_eq!(updated.password_history[0].password, "old");
        assert_eq!(updated.login().unwrap().password_revision_date, Some(now));
    }

    #[test]
    fn test_unchanged_password_keeps_revision_date() {
        let then = Utc::now() - chrono::Duration::days(3);
        let mut existing = login("Site", "jane", "same");
        if let CipherViewData::Login(l) = &mut existing.data {
            l.password_revision_date = Some(then);
        }
        let mut updated = login("Site", "jane", "same");

        update_password_history(&mut updated, &existing, Utc::now());

        assert!(updated.password_history.is_empty());
        assert_eq!(updated.login().unwrap().password_revision_date, Some(then));
    }

    #[test]
    fn test_hidden_field_changes_recorded_and_history_capped() {
        let now = Utc::now();
        let mut existing = login("Site", "jane", "p0");
        for i in 0..4 {
            existing.password_history.push(PasswordHistoryView {
                password: format!("older-{i}"),
                last_used_date: now,
            });
        }
        existing.fields.push(FieldView::hidden("api", "k1"));
        existing.fields.push(FieldView::hidden("gone", "secret"));
        existing.fields.push(FieldView::hidden("kept", "same"));

        let mut updated = login("Site", "jane", "p1");
        updated.fields.push(FieldView::hidden("api", "k2"));
        updated.fields.push(FieldView::hidden("kept", "same"));

        update_password_history(&mut updated, &existing, now);

        let entries: Vec<&str> = updated
            .password_history
            .iter()
            .map(|h| h.password.as_str())
            .collect();
        assert_eq!(entries.len(), MAX_PASSWORD_HISTORY);
        assert_eq!(&entries[..3], &["gone: secret", "api: k1", "p0"]);
        assert!(!entries.contains(&"kept: same"));
    }
}
