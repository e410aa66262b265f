//! Field-level helpers shared by the item models.

use vaultkey_core::VaultKeyResult;
use vaultkey_crypto::{decrypt_to_string, encrypt_str, EncString, SymmetricCryptoKey};

/// Display name given to items that could not be decrypted.
pub const DECRYPT_ERROR_NAME: &str = "[error: cannot decrypt]";

/// Empty and absent values are both stored as absent.
pub(crate) fn encrypt_opt(
    value: Option<&str>,
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<Option<EncString>> {
    match value {
        Some(v) if !v.is_empty() => encrypt_str(v, key).map(Some),
        _ => Ok(None),
    }
}

pub(crate) fn decrypt_opt(
    value: Option<&EncString>,
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<Option<String>> {
    value.map(|v| decrypt_to_string(v, key)).transpose()
}

/// Declare an encrypted record and its decrypted view, where every field is
/// an optional string.
macro_rules! encrypted_record {
    ($(#[$meta:meta])* $name:ident => $view:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<EncString>,
            )+
        }

        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $view {
            $(pub $field: Option<String>,)+
        }

        impl $view {
            pub fn encrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<$name> {
                Ok($name {
                    $($field: $crate::envelope::encrypt_opt(self.$field.as_deref(), key)?,)+
                })
            }
        }

        impl $name {
            pub fn decrypt(&self, key: &SymmetricCryptoKey) -> VaultKeyResult<$view> {
                Ok($view {
                    $($field: $crate::envelope::decrypt_opt(self.$field.as_ref(), key)?,)+
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultkey_crypto::generate_key;

    #[test]
    fn test_empty_values_are_not_encrypted() {
        let key = generate_key(64).unwrap();
        assert!(encrypt_opt(Some(""), &key).unwrap().is_none());
        assert!(encrypt_opt(None, &key).unwrap().is_none());

        let enc = encrypt_opt(Some("v"), &key).unwrap();
        assert_eq!(decrypt_opt(enc.as_ref(), &key).unwrap().as_deref(), Some("v"));
    }
}
