//! EncString: the versioned, self-describing ciphertext wire format
//!
//! ```text
//! 0.<iv>|<data>            AES-256-CBC (legacy, unauthenticated)
//! 1.<iv>|<data>|<mac>      AES-128-CBC + HMAC-SHA256 (legacy, read-only)
//! 2.<iv>|<data>|<mac>      AES-256-CBC + HMAC-SHA256 (current)
//! 3.<data>                 RSA-2048-OAEP-SHA256
//! 4.<data>                 RSA-2048-OAEP-SHA1 (current for new wraps)
//! 5.<data>|<mac>           RSA-2048-OAEP-SHA256 + HMAC (legacy, MAC not checked)
//! 6.<data>|<mac>           RSA-2048-OAEP-SHA1 + HMAC (legacy, MAC not checked)
//! ```
//!
//! Every segment is standard base64. Strings with no `.` header predate the
//! type tag and are typed by segment count.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use vaultkey_core::{VaultKeyError, VaultKeyResult};

use crate::{IV_SIZE, MAC_SIZE};

/// Encryption type tag carried in the `<n>.` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptionType {
    AesCbc256B64 = 0,
    AesCbc128HmacSha256B64 = 1,
    AesCbc256HmacSha256B64 = 2,
    Rsa2048OaepSha256B64 = 3,
    Rsa2048OaepSha1B64 = 4,
    Rsa2048OaepSha256HmacSha256B64 = 5,
    Rsa2048OaepSha1HmacSha256B64 = 6,
}

impl EncryptionType {
    pub fn is_asymmetric(self) -> bool {
        (self as u8) >= 3
    }

    pub fn has_mac(self) -> bool {
        matches!(
            self,
            Self::AesCbc128HmacSha256B64
                | Self::AesCbc256HmacSha256B64
                | Self::Rsa2048OaepSha256HmacSha256B64
                | Self::Rsa2048OaepSha1HmacSha256B64
        )
    }
}

impl TryFrom<u8> for EncryptionType {
    type Error = VaultKeyError;

    fn try_from(tag: u8) -> VaultKeyResult<Self> {
        Ok(match tag {
            0 => Self::AesCbc256B64,
            1 => Self::AesCbc128HmacSha256B64,
            2 => Self::AesCbc256HmacSha256B64,
            3 => Self::Rsa2048OaepSha256B64,
            4 => Self::Rsa2048OaepSha1B64,
            5 => Self::Rsa2048OaepSha256HmacSha256B64,
            6 => Self::Rsa2048OaepSha1HmacSha256B64,
            other => {
                return Err(VaultKeyError::UnsupportedEncryptionType(format!(
                    "unknown encryption type tag {other}"
                )))
            }
        })
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Parsed envelope ciphertext. Decoded once, matched exhaustively afterwards.
#[derive(Clone, PartialEq, Eq)]
pub enum EncString {
    AesCbc256B64 {
        iv: [u8; IV_SIZE],
        data: Vec<u8>,
    },
    AesCbc128HmacSha256B64 {
        iv: [u8; IV_SIZE],
        data: Vec<u8>,
        mac: [u8; MAC_SIZE],
    },
    AesCbc256HmacSha256B64 {
        iv: [u8; IV_SIZE],
        data: Vec<u8>,
        mac: [u8; MAC_SIZE],
    },
    Rsa2048OaepSha256B64 {
        data: Vec<u8>,
    },
    Rsa2048OaepSha1B64 {
        data: Vec<u8>,
    },
    Rsa2048OaepSha256HmacSha256B64 {
        data: Vec<u8>,
        mac: Vec<u8>,
    },
    Rsa2048OaepSha1HmacSha256B64 {
        data: Vec<u8>,
        mac: Vec<u8>,
    },
}

impl EncString {
    pub fn encryption_type(&self) -> EncryptionType {
        match self {
            Self::AesCbc256B64 { .. } => EncryptionType::AesCbc256B64,
            Self::AesCbc128HmacSha256B64 { .. } => EncryptionType::AesCbc128HmacSha256B64,
            Self::AesCbc256HmacSha256B64 { .. } => EncryptionType::AesCbc256HmacSha256B64,
            Self::Rsa2048OaepSha256B64 { .. } => EncryptionType::Rsa2048OaepSha256B64,
            Self::Rsa2048OaepSha1B64 { .. } => EncryptionType::Rsa2048OaepSha1B64,
            Self::Rsa2048OaepSha256HmacSha256B64 { .. } => {
                EncryptionType::Rsa2048OaepSha256HmacSha256B64
            }
            Self::Rsa2048OaepSha1HmacSha256B64 { .. } => {
                EncryptionType::Rsa2048OaepSha1HmacSha256B64
            }
        }
    }

    pub fn iv(&self) -> Option<&[u8; IV_SIZE]> {
        match self {
            Self::AesCbc256B64 { iv, .. }
            | Self::AesCbc128HmacSha256B64 { iv, .. }
            | Self::AesCbc256HmacSha256B64 { iv, .. } => Some(iv),
            _ => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Self::AesCbc256B64 { data, .. }
            | Self::AesCbc128HmacSha256B64 { data, .. }
            | Self::AesCbc256HmacSha256B64 { data, .. }
            | Self::Rsa2048OaepSha256B64 { data }
            | Self::Rsa2048OaepSha1B64 { data }
            | Self::Rsa2048OaepSha256HmacSha256B64 { data, .. }
            | Self::Rsa2048OaepSha1HmacSha256B64 { data, .. } => data,
        }
    }

    pub fn mac(&self) -> Option<&[u8]> {
        match self {
            Self::AesCbc128HmacSha256B64 { mac, .. } | Self::AesCbc256HmacSha256B64 { mac, .. } => {
                Some(mac.as_slice())
            }
            Self::Rsa2048OaepSha256HmacSha256B64 { mac, .. }
            | Self::Rsa2048OaepSha1HmacSha256B64 { mac, .. } => Some(mac.as_slice()),
            _ => None,
        }
    }

    fn from_parts(enc_type: EncryptionType, parts: &[&str]) -> VaultKeyResult<Self> {
        let expected = match enc_type {
            EncryptionType::AesCbc256B64 => 2,
            EncryptionType::AesCbc128HmacSha256B64 | EncryptionType::AesCbc256HmacSha256B64 => 3,
            EncryptionType::Rsa2048OaepSha256B64 | EncryptionType::Rsa2048OaepSha1B64 => 1,
            EncryptionType::Rsa2048OaepSha256HmacSha256B64
            | EncryptionType::Rsa2048OaepSha1HmacSha256B64 => 2,
        };
        if parts.len() != expected {
            return Err(VaultKeyError::InvalidCiphertextFraming(format!(
                "type {enc_type} expects {expected} segment(s), got {}",
                parts.len()
            )));
        }

        Ok(match enc_type {
            EncryptionType::AesCbc256B64 => Self::AesCbc256B64 {
                iv: decode_fixed(parts[0], "iv")?,
                data: decode_segment(parts[1], "data")?,
            },
            EncryptionType::AesCbc128HmacSha256B64 => Self::AesCbc128HmacSha256B64 {
                iv: decode_fixed(parts[0], "iv")?,
                data: decode_segment(parts[1], "data")?,
                mac: decode_fixed(parts[2], "mac")?,
            },
            EncryptionType::AesCbc256HmacSha256B64 => Self::AesCbc256HmacSha256B64 {
                iv: decode_fixed(parts[0], "iv")?,
                data: decode_segment(parts[1], "data")?,
                mac: decode_fixed(parts[2], "mac")?,
            },
            EncryptionType::Rsa2048OaepSha256B64 => Self::Rsa2048OaepSha256B64 {
                data: decode_segment(parts[0], "data")?,
            },
            EncryptionType::Rsa2048OaepSha1B64 => Self::Rsa2048OaepSha1B64 {
                data: decode_segment(parts[0], "data")?,
            },
            EncryptionType::Rsa2048OaepSha256HmacSha256B64 => {
                Self::Rsa2048OaepSha256HmacSha256B64 {
                    data: decode_segment(parts[0], "data")?,
                    mac: decode_segment(parts[1], "mac")?,
                }
            }
            EncryptionType::Rsa2048OaepSha1HmacSha256B64 => Self::Rsa2048OaepSha1HmacSha256B64 {
                data: decode_segment(parts[0], "data")?,
                mac: decode_segment(parts[1], "mac")?,
            },
        })
    }
}

fn decode_segment(segment: &str, what: &str) -> VaultKeyResult<Vec<u8>> {
    STANDARD
        .decode(segment)
        .map_err(|e| VaultKeyError::InvalidCiphertextFraming(format!("{what} is not base64: {e}")))
}

fn decode_fixed<const N: usize>(segment: &str, what: &str) -> VaultKeyResult<[u8; N]> {
    let bytes = decode_segment(segment, what)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        VaultKeyError::InvalidCiphertextFraming(format!("{what} must be {N} bytes, got {len}"))
    })
}

impl FromStr for EncString {
    type Err = VaultKeyError;

    fn from_str(s: &str) -> VaultKeyResult<Self> {
        if s.is_empty() {
            return Err(VaultKeyError::InvalidCiphertextFraming(
                "empty encrypted string".into(),
            ));
        }

        match s.split_once('.') {
            Some((tag, body)) => {
                let tag: u8 = tag.parse().map_err(|_| {
                    VaultKeyError::InvalidCiphertextFraming(format!("bad type header {tag:?}"))
                })?;
                let enc_type = EncryptionType::try_from(tag)?;
                let parts: Vec<&str> = body.split('|').collect();
                Self::from_parts(enc_type, &parts)
            }
            None => {
                let parts: Vec<&str> = s.split('|').collect();
                let enc_type = match parts.len() {
                    3 => EncryptionType::AesCbc128HmacSha256B64,
                    2 => EncryptionType::AesCbc256B64,
                    _ => EncryptionType::Rsa2048OaepSha256B64,
                };
                Self::from_parts(enc_type, &parts)
            }
        }
    }
}

impl fmt::Display for EncString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.encryption_type())?;
        if let Some(iv) = self.iv() {
            write!(f, "{}|", STANDARD.encode(iv))?;
        }
        write!(f, "{}", STANDARD.encode(self.data()))?;
        if let Some(mac) = self.mac() {
            write!(f, "|{}", STANDARD.encode(mac))?;
        }
        Ok(())
    }
}

impl fmt::Debug for EncString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncString")
            .field("type", &self.encryption_type())
            .field("data_len", &self.data().len())
            .finish()
    }
}

impl Serialize for EncString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EncString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
