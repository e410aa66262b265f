//! Symmetric key material, role-typed wrappers, HKDF stretching

use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use vaultkey_core::{VaultKeyError, VaultKeyResult};

use crate::enc_string::EncryptionType;
use crate::{KEY_SIZE, STRETCHED_KEY_SIZE};

/// 32-byte (encryption only) or 64-byte (encryption ‖ MAC) AES key material.
///
/// Zeroized on drop. `Debug` never prints key bytes.
#[derive(Clone)]
pub struct SymmetricCryptoKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SymmetricCryptoKey {
    pub fn from_bytes(bytes: &[u8]) -> VaultKeyResult<Self> {
        match bytes.len() {
            KEY_SIZE | STRETCHED_KEY_SIZE => Ok(Self {
                bytes: Zeroizing::new(bytes.to_vec()),
            }),
            n => Err(VaultKeyError::InvalidKeyMaterial(format!(
                "symmetric key must be {KEY_SIZE} or {STRETCHED_KEY_SIZE} bytes, got {n}"
            ))),
        }
    }

    pub fn from_b64(encoded: &str) -> VaultKeyResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| VaultKeyError::InvalidKeyMaterial(format!("key base64: {e}")))?,
        );
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 of the full key, as persisted for auto-unlock.
    pub fn key_b64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.bytes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_stretched(&self) -> bool {
        self.bytes.len() == STRETCHED_KEY_SIZE
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE]
    }

    pub fn mac_key(&self) -> Option<&[u8]> {
        self.is_stretched().then(|| &self.bytes[KEY_SIZE..])
    }

    /// Symmetric encryption type this key produces.
    pub fn encryption_type(&self) -> EncryptionType {
        if self.is_stretched() {
            EncryptionType::AesCbc256HmacSha256B64
        } else {
            EncryptionType::AesCbc256B64
        }
    }
}

impl PartialEq for SymmetricCryptoKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.len() == other.bytes.len()
            && self
                .bytes
                .iter()
                .zip(other.bytes.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl Eq for SymmetricCryptoKey {}

impl std::fmt::Debug for SymmetricCryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricCryptoKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

macro_rules! role_key {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {$(
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(SymmetricCryptoKey);

        impl $name {
            pub fn new(key: SymmetricCryptoKey) -> Self {
                Self(key)
            }

            pub fn key(&self) -> &SymmetricCryptoKey {
                &self.0
            }

            pub fn into_inner(self) -> SymmetricCryptoKey {
                self.0
            }
        }

        impl AsRef<SymmetricCryptoKey> for $name {
            fn as_ref(&self) -> &SymmetricCryptoKey {
                &self.0
            }
        }

        impl From<SymmetricCryptoKey> for $name {
            fn from(key: SymmetricCryptoKey) -> Self {
                Self(key)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&"[REDACTED]").finish()
            }
        }
    )+};
}

role_key! {
    /// 32-byte key derived from the master password and email. Never leaves the client.
    MasterKey,
    /// 64-byte random key that encrypts vault data. Stored wrapped under the master key.
    UserKey,
    /// Key derived from the unlock PIN, stretched to 64 bytes.
    PinKey,
    /// Organization key, unwrapped with the account private key or a provider key.
    OrgKey,
    /// Provider key, unwrapped with the account private key.
    ProviderKey,
    /// Per-device 64-byte key protecting the user key on trusted devices.
    DeviceKey,
}

/// Fresh random key of `len` bytes (32 or 64).
pub fn generate_key(len: usize) -> VaultKeyResult<SymmetricCryptoKey> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricCryptoKey::from_bytes(&bytes)
}

/// Expand a key into a 64-byte enc ‖ mac key with HKDF-Expand-SHA256.
///
/// The input is used directly as the PRK (no extract step); info strings are
/// `"enc"` and `"mac"`.
pub fn stretch_key(key: &SymmetricCryptoKey) -> VaultKeyResult<SymmetricCryptoKey> {
    let hk = Hkdf::<Sha256>::from_prk(key.as_bytes())
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF PRK: {e}")))?;

    let mut out = Zeroizing::new([0u8; STRETCHED_KEY_SIZE]);
    hk.expand(b"enc", &mut out[..KEY_SIZE])
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF expand enc: {e}")))?;
    hk.expand(b"mac", &mut out[KEY_SIZE..])
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF expand mac: {e}")))?;

    SymmetricCryptoKey::from_bytes(&out[..])
}

/// Derive a Send key from 16 bytes of random key material.
pub fn make_send_key(key_material: &[u8]) -> VaultKeyResult<SymmetricCryptoKey> {
    let hk = Hkdf::<Sha256>::new(Some(&b"bitwarden-send"[..]), key_material);
    let mut out = Zeroizing::new([0u8; STRETCHED_KEY_SIZE]);
    hk.expand(b"send", &mut out[..])
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF expand send: {e}")))?;
    SymmetricCryptoKey::from_bytes(&out[..])
}
