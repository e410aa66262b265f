use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultKeyError, VaultKeyResult};

/// Top-level configuration (loaded from vaultkey.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultKeyConfig {
    pub kdf: KdfDefaults,
    pub storage: StorageConfig,
    pub device: DeviceConfig,
    pub log: LogConfig,
}

impl VaultKeyConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> VaultKeyResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| VaultKeyError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Which KDF new accounts are created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfKind {
    Pbkdf2,
    Argon2id,
}

/// KDF cost parameters applied when registering or changing a master password.
///
/// Existing accounts always use the parameters the server reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfDefaults {
    pub kdf_type: KdfKind,
    /// PBKDF2-SHA256 rounds (default: 600000)
    pub pbkdf2_iterations: u32,
    /// Argon2id time cost (default: 3)
    pub argon2_iterations: u32,
    /// Argon2id memory in MiB (default: 64)
    pub argon2_memory_mib: u32,
    /// Argon2id lanes (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for KdfDefaults {
    fn default() -> Self {
        Self {
            kdf_type: KdfKind::Pbkdf2,
            pbkdf2_iterations: 600_000,
            argon2_iterations: 3,
            argon2_memory_mib: 64,
            argon2_parallelism: 4,
        }
    }
}

/// Where the secure storage tier lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureBackend {
    /// Platform keychain (macOS Keychain, Secret Service, Credential Manager)
    Keychain,
    /// Same JSON file as the disk tier
    File,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state file for the disk tier (in-memory when unset)
    pub state_file: Option<PathBuf>,
    /// Backend for device keys and auto-unlock keys
    pub secure_backend: SecureBackend,
    /// Service name used for keychain entries
    pub keychain_service: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            secure_backend: SecureBackend::Keychain,
            keychain_service: "vaultkey".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable application/device identifier sent to the device registry
    pub identifier: Option<String>,
    /// Human-readable device name
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (default: info)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[kdf]
kdf_type = "argon2id"
argon2_iterations = 4
argon2_memory_mib = 128
argon2_parallelism = 2

[storage]
state_file = "/var/lib/vaultkey/state.json"
secure_backend = "file"
keychain_service = "vaultkey-test"

[device]
identifier = "9f0c3b8e-1d2a-4c5b-8e7f-6a5b4c3d2e1f"
name = "yoga-laptop"

[log]
level = "debug"
format = "json"
"#;
        let config: VaultKeyConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.kdf.kdf_type, KdfKind::Argon2id);
        assert_eq!(config.kdf.argon2_memory_mib, 128);
        assert_eq!(config.kdf.pbkdf2_iterations, 600_000);
        assert_eq!(
            config.storage.state_file,
            Some(PathBuf::from("/var/lib/vaultkey/state.json"))
        );
        assert_eq!(config.storage.secure_backend, SecureBackend::File);
        assert_eq!(config.device.name.as_deref(), Some("yoga-laptop"));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_defaults() {
        let config: VaultKeyConfig = toml::from_str("").unwrap();

        assert_eq!(config.kdf.kdf_type, KdfKind::Pbkdf2);
        assert_eq!(config.kdf.argon2_iterations, 3);
        assert_eq!(config.kdf.argon2_parallelism, 4);
        assert_eq!(config.storage.secure_backend, SecureBackend::Keychain);
        assert_eq!(config.storage.keychain_service, "vaultkey");
        assert!(config.device.identifier.is_none());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultKeyConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.kdf.pbkdf2_iterations, 600_000);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultkey.toml");
        std::fs::write(&path, "[kdf\nkdf_type = ").unwrap();

        let err = VaultKeyConfig::load(&path).unwrap_err();
        assert!(matches!(err, VaultKeyError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = VaultKeyConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: VaultKeyConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.kdf.pbkdf2_iterations, parsed.kdf.pbkdf2_iterations);
        assert_eq!(config.storage.keychain_service, parsed.storage.keychain_service);
        assert_eq!(config.log.level, parsed.log.level);
    }
}
