//! Platform keychain backend for the secure storage tier.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! Entries are named `<scope>/<key>` under the configured service name and
//! hold base64 of the stored value. Keyring calls block, so they run on the
//! blocking pool.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::{Zeroize, Zeroizing};

use vaultkey_core::{VaultKeyError, VaultKeyResult};

use crate::state::{Scope, StateStore};

pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "__vaultkey_availability__").is_ok()
    }

    fn entry_name(scope: &Scope, key: &str) -> String {
        format!("{}/{key}", scope.namespace())
    }

    async fn with_entry<T, F>(&self, scope: &Scope, key: &str, op: F) -> VaultKeyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry, &str) -> VaultKeyResult<T> + Send + 'static,
    {
        let service = self.service.clone();
        let name = Self::entry_name(scope, key);
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &name)
                .map_err(|e| VaultKeyError::Storage(format!("keychain entry creation: {e}")))?;
            op(entry, &name)
        })
        .await
        .map_err(|e| VaultKeyError::Storage(format!("keychain task: {e}")))?
    }
}

#[async_trait]
impl StateStore for KeychainStore {
    async fn get(&self, scope: &Scope, key: &str) -> VaultKeyResult<Option<String>> {
        self.with_entry(scope, key, |entry, name| match entry.get_password() {
            Ok(mut encoded) => {
                let decoded = STANDARD.decode(&encoded);
                encoded.zeroize();
                let bytes = decoded.map_err(|e| {
                    VaultKeyError::Storage(format!("keychain value for '{name}' is not base64: {e}"))
                })?;
                String::from_utf8(bytes).map(Some).map_err(|_| {
                    VaultKeyError::Storage(format!("keychain value for '{name}' is not UTF-8"))
                })
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(VaultKeyError::Storage(format!(
                "keychain get for '{name}': {e}"
            ))),
        })
        .await
    }

    async fn set(&self, scope: &Scope, key: &str, value: &str) -> VaultKeyResult<()> {
        let encoded = Zeroizing::new(STANDARD.encode(value));
        self.with_entry(scope, key, move |entry, name| {
            entry.set_password(&encoded).map_err(|e| {
                VaultKeyError::Storage(format!("keychain store for '{name}': {e}"))
            })?;
            tracing::debug!(key = name, "stored secret in platform keychain");
            Ok(())
        })
        .await
    }

    async fn remove(&self, scope: &Scope, key: &str) -> VaultKeyResult<()> {
        self.with_entry(scope, key, |entry, name| match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = name, "deleted secret from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(VaultKeyError::Storage(format!(
                "keychain delete for '{name}': {e}"
            ))),
        })
        .await
    }
}
