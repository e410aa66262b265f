//! Symmetric envelope encryption: AES-256-CBC, optionally HMAC-SHA256 authenticated
//!
//! Key size selects the scheme:
//! ```text
//! 32-byte key → type 0: AES-256-CBC(key, iv)                  (legacy, read path)
//! 64-byte key → type 2: AES-256-CBC(enc, iv) + HMAC(mac, iv || data)
//! ```
//!
//! The MAC is verified before any CBC decryption is attempted.

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use vaultkey_core::{DecryptFailure, VaultKeyError, VaultKeyResult};

use crate::enc_string::EncString;
use crate::keys::SymmetricCryptoKey;
use crate::{IV_SIZE, MAC_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const BLOCK_SIZE: usize = 16;

/// Output of one AES-CBC encryption, before framing.
pub(crate) struct AesParts {
    pub iv: [u8; IV_SIZE],
    pub data: Vec<u8>,
    pub mac: Option<[u8; MAC_SIZE]>,
}

pub(crate) fn aes_encrypt(plaintext: &[u8], key: &SymmetricCryptoKey) -> VaultKeyResult<AesParts> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let pad_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
    let mut buf = vec![0u8; plaintext.len() + pad_len];
    buf[..plaintext.len()].copy_from_slice(plaintext);

    let data = Aes256CbcEnc::new_from_slices(key.enc_key(), &iv)
        .map_err(|e| VaultKeyError::Crypto(format!("aes init: {e}")))?
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .map_err(|e| VaultKeyError::Crypto(format!("aes encrypt: {e}")))?
        .to_vec();

    let mac = match key.mac_key() {
        Some(mac_key) => Some(compute_mac(mac_key, &iv, &data)?),
        None => None,
    };

    Ok(AesParts { iv, data, mac })
}

pub(crate) fn aes_decrypt(
    key: &SymmetricCryptoKey,
    iv: &[u8; IV_SIZE],
    data: &[u8],
    mac: Option<&[u8; MAC_SIZE]>,
) -> VaultKeyResult<Zeroizing<Vec<u8>>> {
    match (key.mac_key(), mac) {
        (Some(mac_key), Some(mac)) => {
            let mut hmac = HmacSha256::new_from_slice(mac_key)
                .map_err(|e| VaultKeyError::Crypto(format!("hmac init: {e}")))?;
            hmac.update(iv);
            hmac.update(data);
            hmac.verify_slice(mac)
                .map_err(|_| VaultKeyError::DecryptionFailed(DecryptFailure::MacMismatch))?;
        }
        (Some(_), None) => {
            return Err(VaultKeyError::DecryptionFailed(DecryptFailure::MissingMac));
        }
        (None, Some(_)) => {
            return Err(VaultKeyError::DecryptionFailed(
                DecryptFailure::KeyTypeMismatch,
            ));
        }
        (None, None) => {}
    }

    let mut buf = Zeroizing::new(data.to_vec());
    let plaintext = Aes256CbcDec::new_from_slices(key.enc_key(), iv)
        .map_err(|e| VaultKeyError::Crypto(format!("aes init: {e}")))?
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| VaultKeyError::DecryptionFailed(DecryptFailure::Padding))?;

    Ok(Zeroizing::new(plaintext.to_vec()))
}

fn compute_mac(mac_key: &[u8], iv: &[u8], data: &[u8]) -> VaultKeyResult<[u8; MAC_SIZE]> {
    let mut hmac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| VaultKeyError::Crypto(format!("hmac init: {e}")))?;
    hmac.update(iv);
    hmac.update(data);
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&hmac.finalize().into_bytes());
    Ok(mac)
}

/// Encrypt `plaintext` under `key`, producing a type 0 or type 2 envelope.
pub fn encrypt(plaintext: &[u8], key: &SymmetricCryptoKey) -> VaultKeyResult<EncString> {
    let AesParts { iv, data, mac } = aes_encrypt(plaintext, key)?;
    Ok(match mac {
        Some(mac) => EncString::AesCbc256HmacSha256B64 { iv, data, mac },
        None => EncString::AesCbc256B64 { iv, data },
    })
}

pub fn encrypt_str(plaintext: &str, key: &SymmetricCryptoKey) -> VaultKeyResult<EncString> {
    encrypt(plaintext.as_bytes(), key)
}

/// Decrypt a symmetric envelope.
///
/// Asymmetric and AES-128 envelopes are rejected with
/// `UnsupportedEncryptionType`.
pub fn decrypt_to_bytes(
    enc: &EncString,
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<Zeroizing<Vec<u8>>> {
    match enc {
        EncString::AesCbc256B64 { iv, data } => aes_decrypt(key, iv, data, None),
        EncString::AesCbc256HmacSha256B64 { iv, data, mac } => {
            aes_decrypt(key, iv, data, Some(mac))
        }
        EncString::AesCbc128HmacSha256B64 { .. } => Err(VaultKeyError::UnsupportedEncryptionType(
            "AES-128-CBC envelopes are no longer decryptable".into(),
        )),
        other => Err(VaultKeyError::UnsupportedEncryptionType(format!(
            "type {} is asymmetric; use rsa_decrypt",
            other.encryption_type()
        ))),
    }
}

pub fn decrypt_to_string(enc: &EncString, key: &SymmetricCryptoKey) -> VaultKeyResult<String> {
    let bytes = decrypt_to_bytes(enc, key)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| VaultKeyError::DecryptionFailed(DecryptFailure::InvalidUtf8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc_string::EncryptionType;
    use crate::keys::generate_key;
    use proptest::prelude::*;

    #[test]
    fn test_key_size_selects_scheme() {
        let stretched = generate_key(64).unwrap();
        let legacy = generate_key(32).unwrap();

        let enc = encrypt(b"hello", &stretched).unwrap();
        assert_eq!(enc.encryption_type(), EncryptionType::AesCbc256HmacSha256B64);

        let enc = encrypt(b"hello", &legacy).unwrap();
        assert_eq!(enc.encryption_type(), EncryptionType::AesCbc256B64);
        assert!(enc.mac().is_none());
    }

    #[test]
    fn test_roundtrip_through_wire_string() {
        let key = generate_key(64).unwrap();
        let enc = encrypt_str("vault item name", &key).unwrap();
        let parsed: EncString = enc.to_string().parse().unwrap();
        assert_eq!(decrypt_to_string(&parsed, &key).unwrap(), "vault item name");
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = generate_key(64).unwrap();
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a.iv(), b.iv());
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = generate_key(64).unwrap();
        let enc = encrypt(b"", &key).unwrap();
        assert_eq!(enc.data().len(), 16);
        assert!(decrypt_to_bytes(&enc, &key).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_data_fails_mac() {
        let key = generate_key(64).unwrap();
        let enc = encrypt(b"secret", &key).unwrap();
        let EncString::AesCbc256HmacSha256B64 { iv, mut data, mac } = enc else {
            panic!("expected type 2");
        };
        data[0] ^= 0x01;
        let tampered = EncString::AesCbc256HmacSha256B64 { iv, data, mac };

        let err = decrypt_to_bytes(&tampered, &key).unwrap_err();
        assert!(matches!(
            err,
            VaultKeyError::DecryptionFailed(DecryptFailure::MacMismatch)
        ));
    }

    #[test]
    fn test_scheme_mismatch() {
        let stretched = generate_key(64).unwrap();
        let legacy = generate_key(32).unwrap();

        let type0 = encrypt(b"x", &legacy).unwrap();
        assert!(matches!(
            decrypt_to_bytes(&type0, &stretched).unwrap_err(),
            VaultKeyError::DecryptionFailed(DecryptFailure::MissingMac)
        ));

        let type2 = encrypt(b"x", &stretched).unwrap();
        assert!(matches!(
            decrypt_to_bytes(&type2, &legacy).unwrap_err(),
            VaultKeyError::DecryptionFailed(DecryptFailure::KeyTypeMismatch)
        ));
    }

    #[test]
    fn test_rejects_asymmetric_and_aes128() {
        let key = generate_key(64).unwrap();
        let rsa: EncString = "4.AAAA".parse().unwrap();
        assert!(matches!(
            decrypt_to_bytes(&rsa, &key).unwrap_err(),
            VaultKeyError::UnsupportedEncryptionType(_)
        ));

        let aes128 = EncString::AesCbc128HmacSha256B64 {
            iv: [0; 16],
            data: vec![0; 16],
            mac: [0; 32],
        };
        assert!(matches!(
            decrypt_to_bytes(&aes128, &key).unwrap_err(),
            VaultKeyError::UnsupportedEncryptionType(_)
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let key = generate_key(64).unwrap();
        let enc = encrypt(&[0xFF, 0xFE, 0xFD], &key).unwrap();
        assert!(matches!(
            decrypt_to_string(&enc, &key).unwrap_err(),
            VaultKeyError::DecryptionFailed(DecryptFailure::InvalidUtf8)
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            stretched in any::<bool>(),
        ) {
            let key = generate_key(if stretched { 64 } else { 32 }).unwrap();
            let enc = encrypt(&payload, &key).unwrap();
            let out = decrypt_to_bytes(&enc, &key).unwrap();
            prop_assert_eq!(out.as_slice(), payload.as_slice());
        }

        #[test]
        fn prop_string_roundtrip(text in ".{0,256}") {
            let key = generate_key(64).unwrap();
            let enc = encrypt_str(&text, &key).unwrap();
            prop_assert_eq!(decrypt_to_string(&enc, &key).unwrap(), text);
        }

        #[test]
        fn prop_wrong_key_rejected(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let k1 = generate_key(64).unwrap();
            let k2 = generate_key(64).unwrap();
            let enc = encrypt(&payload, &k1).unwrap();
            let err = decrypt_to_bytes(&enc, &k2).unwrap_err();
            prop_assert!(matches!(
                err,
                VaultKeyError::DecryptionFailed(DecryptFailure::MacMismatch)
            ));
        }
    }
}
