//! Key derivation: low-entropy secret (master password or PIN) + salt → 256-bit key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use vaultkey_core::config::{KdfDefaults, KdfKind};
use vaultkey_core::{VaultKeyError, VaultKeyResult};

use crate::keys::SymmetricCryptoKey;
use crate::KEY_SIZE;

pub const PBKDF2_MIN_ITERATIONS: u32 = 5_000;
pub const ARGON2_MIN_ITERATIONS: u32 = 2;
pub const ARGON2_MIN_MEMORY_MIB: u32 = 16;
pub const ARGON2_MAX_MEMORY_MIB: u32 = 1024;
pub const ARGON2_MIN_PARALLELISM: u32 = 1;

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;
pub const DEFAULT_ARGON2_ITERATIONS: u32 = 3;
pub const DEFAULT_ARGON2_MEMORY_MIB: u32 = 64;
pub const DEFAULT_ARGON2_PARALLELISM: u32 = 4;

/// KDF algorithm and cost parameters, as reported by the server at prelogin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kdfType", rename_all = "camelCase")]
pub enum KdfConfig {
    /// PBKDF2-HMAC-SHA256
    #[serde(rename_all = "camelCase")]
    Pbkdf2 { iterations: u32 },
    /// Argon2id v1.3
    #[serde(rename_all = "camelCase")]
    Argon2id {
        iterations: u32,
        memory_mib: u32,
        parallelism: u32,
    },
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self::Pbkdf2 {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl KdfConfig {
    pub fn argon2id_default() -> Self {
        Self::Argon2id {
            iterations: DEFAULT_ARGON2_ITERATIONS,
            memory_mib: DEFAULT_ARGON2_MEMORY_MIB,
            parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }

    /// Build a validated config from the `[kdf]` section of the config file.
    pub fn from_defaults(defaults: &KdfDefaults) -> VaultKeyResult<Self> {
        let config = match defaults.kdf_type {
            KdfKind::Pbkdf2 => Self::Pbkdf2 {
                iterations: defaults.pbkdf2_iterations,
            },
            KdfKind::Argon2id => Self::Argon2id {
                iterations: defaults.argon2_iterations,
                memory_mib: defaults.argon2_memory_mib,
                parallelism: defaults.argon2_parallelism,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Numeric KDF type used on the wire (0 = PBKDF2-SHA256, 1 = Argon2id).
    pub fn kdf_type(&self) -> u8 {
        match self {
            Self::Pbkdf2 { .. } => 0,
            Self::Argon2id { .. } => 1,
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            Self::Pbkdf2 { iterations } | Self::Argon2id { iterations, .. } => *iterations,
        }
    }

    /// Reject parameters below the minimums every client enforces.
    pub fn validate(&self) -> VaultKeyResult<()> {
        match *self {
            Self::Pbkdf2 { iterations } => {
                if iterations < PBKDF2_MIN_ITERATIONS {
                    return Err(VaultKeyError::InvalidKdfParameters(format!(
                        "PBKDF2 iteration minimum is {PBKDF2_MIN_ITERATIONS}, got {iterations}"
                    )));
                }
            }
            Self::Argon2id {
                iterations,
                memory_mib,
                parallelism,
            } => {
                if iterations < ARGON2_MIN_ITERATIONS {
                    return Err(VaultKeyError::InvalidKdfParameters(format!(
                        "Argon2 iteration minimum is {ARGON2_MIN_ITERATIONS}, got {iterations}"
                    )));
                }
                if memory_mib < ARGON2_MIN_MEMORY_MIB {
                    return Err(VaultKeyError::InvalidKdfParameters(format!(
                        "Argon2 memory minimum is {ARGON2_MIN_MEMORY_MIB} MiB, got {memory_mib}"
                    )));
                }
                if memory_mib > ARGON2_MAX_MEMORY_MIB {
                    return Err(VaultKeyError::InvalidKdfParameters(format!(
                        "Argon2 memory maximum is {ARGON2_MAX_MEMORY_MIB} MiB, got {memory_mib}"
                    )));
                }
                if parallelism < ARGON2_MIN_PARALLELISM {
                    return Err(VaultKeyError::InvalidKdfParameters(format!(
                        "Argon2 parallelism minimum is {ARGON2_MIN_PARALLELISM}, got {parallelism}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Derive a 32-byte key from `secret` and `salt` under `config`.
///
/// PBKDF2 uses the salt bytes as given. Argon2id hashes the salt with
/// SHA-256 first so that short salts (emails) meet Argon2's length rules;
/// every client does this, so it cannot change.
pub fn derive_key(
    secret: &SecretString,
    salt: &str,
    config: &KdfConfig,
) -> VaultKeyResult<SymmetricCryptoKey> {
    config.validate()?;

    let password = secret.expose_secret().as_bytes();
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);

    match *config {
        KdfConfig::Pbkdf2 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt.as_bytes(), iterations, &mut key[..]);
        }
        KdfConfig::Argon2id {
            iterations,
            memory_mib,
            parallelism,
        } => {
            let salt_hash = Sha256::digest(salt.as_bytes());

            let params = Params::new(memory_mib * 1024, iterations, parallelism, Some(KEY_SIZE))
                .map_err(|e| VaultKeyError::InvalidKdfParameters(format!("argon2 params: {e}")))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(password, &salt_hash, &mut key[..])
                .map_err(|e| VaultKeyError::Crypto(format!("Argon2id KDF failed: {e}")))?;
        }
    }

    SymmetricCryptoKey::from_bytes(&key[..])
}
