use thiserror::Error;

pub type VaultKeyResult<T> = Result<T, VaultKeyError>;

/// Why an envelope failed to open.
///
/// Kept separate from the framing errors so callers can tell a wrong key
/// apart from a foreign or corrupt ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// HMAC over `iv || data` did not verify
    MacMismatch,
    /// PKCS#7 padding was invalid after CBC decryption
    Padding,
    /// The key's scheme does not match the envelope's encryption type
    KeyTypeMismatch,
    /// An authenticated key was given an envelope without a MAC
    MissingMac,
    /// Plaintext was expected to be UTF-8
    InvalidUtf8,
    /// RSA-OAEP decryption rejected the ciphertext
    Rsa,
}

impl std::fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::MacMismatch => "MAC verification failed",
            Self::Padding => "invalid padding",
            Self::KeyTypeMismatch => "key does not match encryption type",
            Self::MissingMac => "MAC required but missing",
            Self::InvalidUtf8 => "plaintext is not valid UTF-8",
            Self::Rsa => "RSA-OAEP decryption failed",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum VaultKeyError {
    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParameters(String),

    #[error("no master key available")]
    NoMasterKey,

    #[error("no user key available")]
    NoUserKey,

    #[error("no private key available")]
    NoPrivateKey,

    #[error("no public key available")]
    NoPublicKey,

    #[error("no encrypted user key found")]
    NoEncryptedUserKey,

    #[error("no PIN protected key found")]
    NoPinProtectedKey,

    #[error("no key available for organization {0}")]
    NoOrganizationKey(String),

    /// Wrong master password or PIN.
    #[error("invalid master key")]
    InvalidMasterKey,

    #[error("decryption failed: {0}")]
    DecryptionFailed(DecryptFailure),

    #[error("unsupported encryption type: {0}")]
    UnsupportedEncryptionType(String),

    #[error("invalid ciphertext framing: {0}")]
    InvalidCiphertextFraming(String),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("device registry error: {0}")]
    Registry(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultKeyError {
    /// True for every failure caused by a ciphertext that could not be opened
    /// with the key supplied (wrong key, corrupt data, foreign format).
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed(_)
                | Self::InvalidMasterKey
                | Self::UnsupportedEncryptionType(_)
                | Self::InvalidCiphertextFraming(_)
        )
    }

    /// True when the caller should prompt the user to re-authenticate.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::NoMasterKey | Self::NoUserKey | Self::NoPrivateKey | Self::InvalidMasterKey
        )
    }
}
