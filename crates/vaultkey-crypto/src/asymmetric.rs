//! RSA-2048 key pairs and OAEP key wrapping
//!
//! Public keys travel as SPKI DER, private keys as PKCS#8 DER. New wraps are
//! always OAEP-SHA1 (type 4); decryption accepts every asymmetric type and
//! picks the OAEP hash from the type tag. The HMAC carried by types 5 and 6
//! is not verified.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use vaultkey_core::{DecryptFailure, VaultKeyError, VaultKeyResult};

use crate::enc_string::EncString;

pub const RSA_KEY_BITS: usize = 2048;

/// Freshly generated key pair.
pub struct RsaKeyPair {
    /// SPKI DER
    pub public_key: Vec<u8>,
    /// PKCS#8 DER
    pub private_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("public_key_len", &self.public_key.len())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

pub fn generate_key_pair() -> VaultKeyResult<RsaKeyPair> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| VaultKeyError::Crypto(format!("RSA keygen: {e}")))?;
    let public = RsaPublicKey::from(&private);

    let private_der = private
        .to_pkcs8_der()
        .map_err(|e| VaultKeyError::Crypto(format!("PKCS#8 encode: {e}")))?;
    let public_der = public
        .to_public_key_der()
        .map_err(|e| VaultKeyError::Crypto(format!("SPKI encode: {e}")))?;

    Ok(RsaKeyPair {
        public_key: public_der.as_bytes().to_vec(),
        private_key: Zeroizing::new(private_der.as_bytes().to_vec()),
    })
}

/// Derive the SPKI public key from a PKCS#8 private key.
///
/// Also serves as a validity check for a freshly decrypted private key.
pub fn extract_public_key(private_key: &[u8]) -> VaultKeyResult<Vec<u8>> {
    let private = parse_private_key(private_key)?;
    let public_der = RsaPublicKey::from(&private)
        .to_public_key_der()
        .map_err(|e| VaultKeyError::Crypto(format!("SPKI encode: {e}")))?;
    Ok(public_der.as_bytes().to_vec())
}

/// Wrap `data` to `public_key` with RSA-OAEP-SHA1 (type 4).
pub fn rsa_encrypt(data: &[u8], public_key: &[u8]) -> VaultKeyResult<EncString> {
    let public = RsaPublicKey::from_public_key_der(public_key)
        .map_err(|e| VaultKeyError::InvalidKeyMaterial(format!("SPKI parse: {e}")))?;
    let wrapped = public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), data)
        .map_err(|e| VaultKeyError::Crypto(format!("RSA encrypt: {e}")))?;
    Ok(EncString::Rsa2048OaepSha1B64 { data: wrapped })
}

pub fn rsa_decrypt(enc: &EncString, private_key: &[u8]) -> VaultKeyResult<Zeroizing<Vec<u8>>> {
    let (padding, data) = match enc {
        EncString::Rsa2048OaepSha256B64 { data }
        | EncString::Rsa2048OaepSha256HmacSha256B64 { data, .. } => (Oaep::new::<Sha256>(), data),
        EncString::Rsa2048OaepSha1B64 { data }
        | EncString::Rsa2048OaepSha1HmacSha256B64 { data, .. } => (Oaep::new::<Sha1>(), data),
        other => {
            return Err(VaultKeyError::UnsupportedEncryptionType(format!(
                "type {} is not an RSA envelope",
                other.encryption_type()
            )))
        }
    };

    let private = parse_private_key(private_key)?;
    let plaintext = private.decrypt(padding, data).map_err(|e| {
        tracing::debug!("RSA-OAEP decrypt rejected: {e}");
        VaultKeyError::DecryptionFailed(DecryptFailure::Rsa)
    })?;
    Ok(Zeroizing::new(plaintext))
}

fn parse_private_key(private_key: &[u8]) -> VaultKeyResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(private_key)
        .map_err(|e| VaultKeyError::InvalidKeyMaterial(format!("PKCS#8 parse: {e}")))
}
