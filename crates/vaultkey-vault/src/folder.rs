//! Folder encryption.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultkey_core::{UserId, VaultKeyResult};
use vaultkey_crypto::{decrypt_to_string, encrypt_str, EncString, SymmetricCryptoKey};
use vaultkey_keys::KeyService;

use crate::envelope::DECRYPT_ERROR_NAME;

/// Folder as stored and synced: the name is encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: Option<String>,
    pub name: EncString,
    pub revision_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderView {
    pub id: Option<String>,
    pub name: String,
    pub revision_date: DateTime<Utc>,
}

impl FolderView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            revision_date: Utc::now(),
        }
    }
}

pub struct FolderService {
    keys: Arc<KeyService>,
}

impl FolderService {
    pub fn new(keys: Arc<KeyService>) -> Self {
        Self { keys }
    }

    /// Encrypt under `key`, or the account's encryption key when `None`.
    pub async fn encrypt(
        &self,
        user: &UserId,
        view: &FolderView,
        key: Option<&SymmetricCryptoKey>,
    ) -> VaultKeyResult<Folder> {
        let name = match key {
            Some(key) => encrypt_str(&view.name, key)?,
            None => encrypt_str(&view.name, &self.keys.encryption_key(user).await?)?,
        };
        Ok(Folder {
            id: view.id.clone(),
            name,
            revision_date: view.revision_date,
        })
    }

    pub async fn decrypt(&self, user: &UserId, folder: &Folder) -> VaultKeyResult<FolderView> {
        let key = self.keys.encryption_key(user).await?;
        decrypt_folder(folder, &key)
    }

    /// Decrypt a batch sorted by name. Folders that fail to decrypt come back
    /// named [`DECRYPT_ERROR_NAME`] instead of failing the batch.
    pub async fn decrypt_all(
        &self,
        user: &UserId,
        folders: &[Folder],
    ) -> VaultKeyResult<Vec<FolderView>> {
        let key = self.keys.encryption_key(user).await?;
        let mut views: Vec<FolderView> = folders
            .iter()
            .map(|folder| {
                decrypt_folder(folder, &key).unwrap_or_else(|e| {
                    tracing::warn!(user = %user, folder = ?folder.id, error = %e, "folder decrypt failed");
                    FolderView {
                        id: folder.id.clone(),
                        name: DECRYPT_ERROR_NAME.to_string(),
                        revision_date: folder.revision_date,
                    }
                })
            })
            .collect();
        views.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(views)
    }
}

fn decrypt_folder(folder: &Folder, key: &SymmetricCryptoKey) -> VaultKeyResult<FolderView> {
    Ok(FolderView {
        id: folder.id.clone(),
        name: decrypt_to_string(&folder.name, key)?,
        revision_date: folder.revision_date,
    })
}
