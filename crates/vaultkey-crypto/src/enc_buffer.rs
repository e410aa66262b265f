//! Binary envelope for attachment-sized payloads
//!
//! ```text
//! type 2: [0x02][16 bytes: iv][32 bytes: mac][N bytes: ciphertext]
//! type 0: [0x00][16 bytes: iv][N bytes: ciphertext]
//! ```

use zeroize::Zeroizing;

use vaultkey_core::{VaultKeyError, VaultKeyResult};

use crate::enc_string::EncryptionType;
use crate::encrypt::{aes_decrypt, aes_encrypt, AesParts};
use crate::keys::SymmetricCryptoKey;
use crate::{IV_SIZE, MAC_SIZE};

/// Raw bytes of a binary envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncArrayBuffer {
    buffer: Vec<u8>,
}

impl EncArrayBuffer {
    /// Validate the header and lengths of a received buffer.
    pub fn from_bytes(buffer: Vec<u8>) -> VaultKeyResult<Self> {
        let tag = *buffer.first().ok_or_else(|| {
            VaultKeyError::InvalidCiphertextFraming("empty encrypted buffer".into())
        })?;

        let header = match EncryptionType::try_from(tag)? {
            EncryptionType::AesCbc256HmacSha256B64 => 1 + IV_SIZE + MAC_SIZE,
            EncryptionType::AesCbc256B64 => 1 + IV_SIZE,
            other => {
                return Err(VaultKeyError::UnsupportedEncryptionType(format!(
                    "type {other} is not valid for a binary envelope"
                )))
            }
        };
        if buffer.len() <= header {
            return Err(VaultKeyError::InvalidCiphertextFraming(format!(
                "encrypted buffer too short: {} bytes (header {header})",
                buffer.len()
            )));
        }
        Ok(Self { buffer })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn encryption_type(&self) -> VaultKeyResult<EncryptionType> {
        EncryptionType::try_from(self.buffer[0])
    }

    fn split(&self) -> VaultKeyResult<([u8; IV_SIZE], Option<[u8; MAC_SIZE]>, &[u8])> {
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.buffer[1..1 + IV_SIZE]);
        let rest = &self.buffer[1 + IV_SIZE..];

        match self.encryption_type()? {
            EncryptionType::AesCbc256HmacSha256B64 => {
                let mut mac = [0u8; MAC_SIZE];
                mac.copy_from_slice(&rest[..MAC_SIZE]);
                Ok((iv, Some(mac), &rest[MAC_SIZE..]))
            }
            _ => Ok((iv, None, rest)),
        }
    }
}

/// Encrypt bytes into a binary envelope.
pub fn encrypt_to_buffer(
    plaintext: &[u8],
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<EncArrayBuffer> {
    let AesParts { iv, data, mac } = aes_encrypt(plaintext, key)?;

    let mut buffer = Vec::with_capacity(1 + IV_SIZE + MAC_SIZE + data.len());
    buffer.push(key.encryption_type() as u8);
    buffer.extend_from_slice(&iv);
    if let Some(mac) = mac {
        buffer.extend_from_slice(&mac);
    }
    buffer.extend_from_slice(&data);

    Ok(EncArrayBuffer { buffer })
}

pub fn decrypt_from_buffer(
    enc: &EncArrayBuffer,
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<Zeroizing<Vec<u8>>> {
    let (iv, mac, data) = enc.split()?;
    aes_decrypt(key, &iv, data, mac.as_ref())
}
