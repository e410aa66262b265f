//! vaultkey-crypto: client-side envelope encryption for the vault key hierarchy
//!
//! Key hierarchy:
//! ```text
//! Master Key (32 bytes, PBKDF2-SHA256 or Argon2id of password + email)
//!   └── stretch (HKDF-Expand "enc"/"mac") → 64-byte wrapping key
//!       └── User Key (64 bytes random, stored as a type 2 EncString)
//!           ├── vault data: AES-256-CBC + HMAC-SHA256 EncStrings
//!           └── RSA-2048 private key (PKCS#8, stored encrypted under the user key)
//!               ├── Organization Keys (RSA-OAEP wrapped to the account public key)
//!               └── Provider Keys     (RSA-OAEP wrapped to the account public key)
//!
//! Device Key (64 bytes random, local only)
//!   └── device RSA private key → RSA-OAEP wrapped copy of the User Key
//! ```

pub mod asymmetric;
pub mod enc_buffer;
pub mod enc_string;
pub mod encrypt;
pub mod fingerprint;
pub mod hash;
pub mod kdf;
pub mod keys;

pub use asymmetric::{extract_public_key, generate_key_pair, rsa_decrypt, rsa_encrypt, RsaKeyPair};
pub use enc_buffer::{decrypt_from_buffer, encrypt_to_buffer, EncArrayBuffer};
pub use enc_string::{EncString, EncryptionType};
pub use encrypt::{decrypt_to_bytes, decrypt_to_string, encrypt, encrypt_str};
pub use fingerprint::{fingerprint, hash_phrase};
pub use hash::{hash_password, hashes_equal};
pub use kdf::{derive_key, KdfConfig};
pub use keys::{
    generate_key, make_send_key, stretch_key, DeviceKey, MasterKey, OrgKey, PinKey, ProviderKey,
    SymmetricCryptoKey, UserKey,
};

/// Size of an AES-256 key / master key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a stretched enc ‖ mac key
pub const STRETCHED_KEY_SIZE: usize = 64;

/// AES-CBC IV size
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tag size
pub const MAC_SIZE: usize = 32;
