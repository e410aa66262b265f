//! Stored FIDO2 credentials (passkeys) attached to login items.
//!
//! Every field is an EncString on the wire, including the signature counter
//! and the discoverable flag.

use serde::{Deserialize, Serialize};

use vaultkey_core::VaultKeyResult;
use vaultkey_crypto::{decrypt_to_string, encrypt_str, EncString, SymmetricCryptoKey};

use crate::envelope::{decrypt_opt, encrypt_opt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fido2Key {
    #[serde(default)]
    pub credential_id: Option<EncString>,
    pub key_type: EncString,
    pub key_algorithm: EncString,
    pub key_curve: EncString,
    /// PKCS#8 private key, base64
    pub key_value: EncString,
    pub rp_id: EncString,
    #[serde(default)]
    pub user_handle: Option<EncString>,
    pub counter: EncString,
    #[serde(default)]
    pub rp_name: Option<EncString>,
    #[serde(default)]
    pub user_display_name: Option<EncString>,
    pub discoverable: EncString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fido2KeyView {
    pub credential_id: Option<String>,
    pub key_type: String,
    pub key_algorithm: String,
    pub key_curve: String,
    pub key_value: String,
    pub rp_id: String,
    pub user_handle: Option<String>,
    pub counter: u32,
    pub rp_name: Option<String>,
    pub user_display_name: Option<String>,
    pub discoverable: bool,
}

impl Default for Fido2KeyView {
    fn default() -> Self {
        Self {
            credential_id: None,
            key_type: "public-key".into(),
            key_algorithm: "ECDSA".into(),
            key_curve: "P-256".into(),
            key_value: String::new(),
            rp_id: String::new(),
            user_handle: None,
            counter: 0,
            rp_name: None,
            user_display_name: None,
            discoverable: false,
        }
    }
}

impl Fido2KeyView {
    pub fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<Fido2Key> {
        Ok(Fido2Key {
            credential_id: encrypt_opt(self.credential_id.as_deref(), key)?,
            key_type: encrypt_str(&self.key_type, key)?,
            key_algorithm: encrypt_str(&self.key_algorithm, key)?,
            key_curve: encrypt_str(&self.key_curve, key)?,
            key_value: encrypt_str(&self.key_value, key)?,
            rp_id: encrypt_str(&self.rp_id, key)?,
            user_handle: encrypt_opt(self.user_handle.as_deref(), key)?,
            counter: encrypt_str(&self.counter.to_string(), key)?,
            rp_name: encrypt_opt(self.rp_name.as_deref(), key)?,
            user_display_name: encrypt_opt(self.user_display_name.as_deref(), key)?,
            discoverable: encrypt_str(if self.discoverable { "true" } else { "false" }, key)?,
        })
    }
}

impl Fido2Key {
    pub fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<Fido2KeyView> {
        let counter = decrypt_to_string(&self.counter, key)?;
        let counter = counter.trim().parse::<u32>().unwrap_or_else(|_| {
            tracing::warn!("stored FIDO2 counter is not a number, resetting to 0");
            0
        });

        Ok(Fido2KeyView {
            credential_id: decrypt_opt(self.credential_id.as_ref(), key)?,
            key_type: decrypt_to_string(&self.key_type, key)?,
            key_algorithm: decrypt_to_string(&self.key_algorithm, key)?,
            key_curve: decrypt_to_string(&self.key_curve, key)?,
            key_value: decrypt_to_string(&self.key_value, key)?,
            rp_id: decrypt_to_string(&self.rp_id, key)?,
            user_handle: decrypt_opt(self.user_handle.as_ref(), key)?,
            counter,
            rp_name: decrypt_opt(self.rp_name.as_ref(), key)?,
            user_display_name: decrypt_opt(self.user_display_name.as_ref(), key)?,
            discoverable: decrypt_to_string(&self.discoverable, key)? == "true",
        })
    }
}
