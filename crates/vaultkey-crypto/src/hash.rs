//! Master password hashes for server authentication and local unlock checks

use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use vaultkey_core::HashPurpose;

use crate::keys::MasterKey;

/// PBKDF2-SHA256 with the master key as the password and the master password
/// as the salt, base64 encoded.
///
/// One round is the value sent to the server; two rounds is the value kept
/// locally for offline unlock. The two must never be swapped.
pub fn hash_password(password: &SecretString, master_key: &MasterKey, purpose: HashPurpose) -> String {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        master_key.key().as_bytes(),
        password.expose_secret().as_bytes(),
        purpose.iterations(),
        &mut out,
    );
    STANDARD.encode(out)
}

/// Constant-time comparison of two encoded hashes.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
