//! Account fingerprint phrases.
//!
//! The phrase is derived from the account public key so two parties can
//! compare it out of band before trusting each other's key:
//!
//! ```text
//! SHA-256(public key) ──HKDF-Expand(info = material)──▶ 32 bytes ──▶ words
//! ```

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use vaultkey_core::{VaultKeyError, VaultKeyResult};

/// Minimum entropy a fingerprint phrase carries, in bits.
pub const FINGERPRINT_ENTROPY_BITS: u32 = 64;

/// Fingerprint phrase for `public_key`, bound to `material` (usually the
/// account or organization id).
pub fn fingerprint(material: &str, public_key: &[u8]) -> VaultKeyResult<Vec<String>> {
    let key_fingerprint = Sha256::digest(public_key);
    let hk = Hkdf::<Sha256>::from_prk(&key_fingerprint)
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF PRK: {e}")))?;
    let mut user_fingerprint = [0u8; 32];
    hk.expand(material.as_bytes(), &mut user_fingerprint)
        .map_err(|e| VaultKeyError::Crypto(format!("HKDF expand: {e}")))?;

    hash_phrase(
        &user_fingerprint,
        bip39::Language::English.word_list(),
        FINGERPRINT_ENTROPY_BITS,
    )
}

/// Encode `hash` as words from `words`, least significant word first.
///
/// The hash is read as one big-endian integer and repeatedly divided by the
/// list length. Enough words are emitted to carry `minimum_entropy` bits;
/// the hash must offer at least 4 bits per byte for that many words.
pub fn hash_phrase(
    hash: &[u8],
    words: &[&str],
    minimum_entropy: u32,
) -> VaultKeyResult<Vec<String>> {
    if words.len() < 2 {
        return Err(VaultKeyError::InvalidKeyMaterial(
            "word list needs at least two words".into(),
        ));
    }
    let entropy_per_word = (words.len() as f64).log2();
    let num_words = (f64::from(minimum_entropy) / entropy_per_word).ceil() as usize;

    let entropy_available = (hash.len() * 4) as f64;
    if num_words as f64 * entropy_per_word > entropy_available {
        return Err(VaultKeyError::InvalidKeyMaterial(
            "output entropy of hash function is too small".into(),
        ));
    }

    let divisor = words.len() as u32;
    let mut number = hash.to_vec();
    let mut phrase = Vec::with_capacity(num_words);
    for _ in 0..num_words {
        let remainder = div_rem(&mut number, divisor);
        phrase.push(words[remainder as usize].to_string());
    }
    Ok(phrase)
}

/// Divide a big-endian integer in place, returning the remainder.
fn div_rem(number: &mut [u8], divisor: u32) -> u32 {
    let mut remainder: u64 = 0;
    for byte in number.iter_mut() {
        let acc = (remainder << 8) | u64::from(*byte);
        *byte = (acc / u64::from(divisor)) as u8;
        remainder = acc % u64::from(divisor);
    }
    remainder as u32
}
