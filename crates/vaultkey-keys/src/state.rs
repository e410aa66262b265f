//! Key-value state stores the key hierarchy persists into.
//!
//! Two tiers are addressed through [`Storage`]:
//!   - **Disk**: wrapped keys, key hash, encrypted org/provider maps.
//!   - **Secure**: raw device keys and auto-unlock user keys. Backed by the
//!     platform keychain where available.
//!
//! Every value is a string (EncString wire form, base64 or JSON).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use vaultkey_core::config::{SecureBackend, StorageConfig};
use vaultkey_core::{UserId, VaultKeyError, VaultKeyResult};

use crate::keychain::KeychainStore;

/// Whose state a value belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Account(UserId),
    Global,
}

impl Scope {
    /// Stable textual form, used as a namespace by the file and keychain backends.
    pub fn namespace(&self) -> String {
        match self {
            Scope::Account(user) => format!("user:{user}"),
            Scope::Global => "global".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Disk,
    Secure,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    pub scope: Scope,
    pub tier: Tier,
}

impl StorageLocation {
    pub fn disk(user: &UserId) -> Self {
        Self {
            scope: Scope::Account(user.clone()),
            tier: Tier::Disk,
        }
    }

    pub fn secure(user: &UserId) -> Self {
        Self {
            scope: Scope::Account(user.clone()),
            tier: Tier::Secure,
        }
    }

    pub fn global() -> Self {
        Self {
            scope: Scope::Global,
            tier: Tier::Disk,
        }
    }
}

/// Well-known state keys
pub mod keys {
    /// User key wrapped under the (stretched) master key
    pub const ENCRYPTED_USER_KEY: &str = "master_key_encrypted_user_key";
    /// Raw user key for auto-unlock (secure tier, base64)
    pub const USER_KEY_AUTO: &str = "user_key_auto";
    /// Local-authorization master password hash
    pub const KEY_HASH: &str = "key_hash";
    /// Account RSA private key wrapped under the user key
    pub const ENCRYPTED_PRIVATE_KEY: &str = "encrypted_private_key";
    /// JSON map: organization id → encrypted org key
    pub const ENCRYPTED_ORG_KEYS: &str = "encrypted_organization_keys";
    /// JSON map: provider id → RSA-wrapped provider key
    pub const ENCRYPTED_PROVIDER_KEYS: &str = "encrypted_provider_keys";
    /// User key wrapped under the PIN key
    pub const PIN_KEY_ENCRYPTED_USER_KEY: &str = "pin_key_encrypted_user_key";
    /// JSON: PIN encrypted under the user key, plus its salt and KDF
    pub const PROTECTED_PIN: &str = "protected_pin";
    /// Legacy: master key wrapped under the PIN key
    pub const PIN_PROTECTED_MASTER_KEY: &str = "pin_protected_master_key";
    /// Legacy: raw master key for auto-unlock (secure tier, base64)
    pub const MASTER_KEY_AUTO: &str = "master_key_auto";
    /// Trusted device key (secure tier, base64)
    pub const DEVICE_KEY: &str = "device_key";
    /// One-shot "trust this device" choice made at login
    pub const SHOULD_TRUST_DEVICE: &str = "should_trust_device";
    /// Generated installation identifier (global scope)
    pub const APP_ID: &str = "app_id";
}

/// A string key-value store partitioned by [`Scope`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, scope: &Scope, key: &str) -> VaultKeyResult<Option<String>>;
    async fn set(&self, scope: &Scope, key: &str, value: &str) -> VaultKeyResult<()>;
    async fn remove(&self, scope: &Scope, key: &str) -> VaultKeyResult<()>;
}

// ── MemoryStore ─────────────────────────────────────────────────

/// Process-memory store. Used for tests and for the secure tier when no
/// keychain is wanted.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(Scope, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, scope: &Scope, key: &str) -> VaultKeyResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(scope.clone(), key.to_string()))
            .cloned())
    }

    async fn set(&self, scope: &Scope, key: &str, value: &str) -> VaultKeyResult<()> {
        self.entries
            .write()
            .await
            .insert((scope.clone(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, scope: &Scope, key: &str) -> VaultKeyResult<()> {
        self.entries
            .write()
            .await
            .remove(&(scope.clone(), key.to_string()));
        Ok(())
    }
}

// ── JsonFileStore ───────────────────────────────────────────────

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

/// JSON file store: loaded into memory at open, every write flushed
/// atomically via temp+rename.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Namespaces>,
}

impl JsonFileStore {
    /// Load or create a store at `path`. A missing file starts empty.
    pub async fn open(path: &Path) -> VaultKeyResult<Self> {
        let entries = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                VaultKeyError::Storage(format!("parsing state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &Namespaces) -> VaultKeyResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| VaultKeyError::Storage(format!("serializing state: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, scope: &Scope, key: &str) -> VaultKeyResult<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&scope.namespace())
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn set(&self, scope: &Scope, key: &str, value: &str) -> VaultKeyResult<()> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(scope.namespace())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.flush(&entries).await
    }

    async fn remove(&self, scope: &Scope, key: &str) -> VaultKeyResult<()> {
        let mut entries = self.entries.lock().await;
        let namespace = scope.namespace();
        let Some(ns) = entries.get_mut(&namespace) else {
            return Ok(());
        };
        if ns.remove(key).is_none() {
            return Ok(());
        }
        if ns.is_empty() {
            entries.remove(&namespace);
        }
        self.flush(&entries).await
    }
}

// ── Storage ─────────────────────────────────────────────────────

/// The two storage tiers, addressed by [`StorageLocation`].
#[derive(Clone)]
pub struct Storage {
    disk: Arc<dyn StateStore>,
    secure: Arc<dyn StateStore>,
}

impl Storage {
    pub fn new(disk: Arc<dyn StateStore>, secure: Arc<dyn StateStore>) -> Self {
        Self { disk, secure }
    }

    /// Both tiers in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    /// Build the tiers described by the `[storage]` config section.
    pub async fn from_config(config: &StorageConfig) -> VaultKeyResult<Self> {
        let disk: Arc<dyn StateStore> = match &config.state_file {
            Some(path) => Arc::new(JsonFileStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };

        let secure: Arc<dyn StateStore> = match config.secure_backend {
            SecureBackend::Keychain => Arc::new(KeychainStore::new(&config.keychain_service)),
            SecureBackend::File => disk.clone(),
            SecureBackend::Memory => Arc::new(MemoryStore::new()),
        };

        tracing::debug!(
            state_file = ?config.state_file,
            secure_backend = ?config.secure_backend,
            "opened key storage"
        );
        Ok(Self::new(disk, secure))
    }

    fn store(&self, tier: Tier) -> &dyn StateStore {
        match tier {
            Tier::Disk => self.disk.as_ref(),
            Tier::Secure => self.secure.as_ref(),
        }
    }

    pub async fn get(&self, location: &StorageLocation, key: &str) -> VaultKeyResult<Option<String>> {
        self.store(location.tier).get(&location.scope, key).await
    }

    pub async fn set(&self, location: &StorageLocation, key: &str, value: &str) -> VaultKeyResult<()> {
        self.store(location.tier).set(&location.scope, key, value).await
    }

    pub async fn remove(&self, location: &StorageLocation, key: &str) -> VaultKeyResult<()> {
        self.store(location.tier).remove(&location.scope, key).await
    }

    /// Parse a stored value with `FromStr` (EncStrings, booleans).
    pub async fn get_parsed<T>(&self, location: &StorageLocation, key: &str) -> VaultKeyResult<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(location, key).await? {
            Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| {
                VaultKeyError::Storage(format!("stored value {key:?} is malformed: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        location: &StorageLocation,
        key: &str,
    ) -> VaultKeyResult<Option<T>> {
        match self.get(location, key).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                VaultKeyError::Storage(format!("stored value {key:?} is malformed: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        location: &StorageLocation,
        key: &str,
        value: &T,
    ) -> VaultKeyResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| VaultKeyError::Storage(format!("serializing {key:?}: {e}")))?;
        self.set(location, key, &json).await
    }
}
