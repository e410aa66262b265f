use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random v4 identifier.
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Account identifier; every key cache and storage scope is keyed by it.
    UserId
);
string_id!(
    /// Organization identifier
    OrganizationId
);
string_id!(
    /// Provider identifier
    ProviderId
);

/// What a master password hash is used for.
///
/// The two hashes differ only in iteration count and must never be swapped:
/// the server hash is sent over the wire, the local hash is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashPurpose {
    ServerAuthorization,
    LocalAuthorization,
}

impl HashPurpose {
    pub fn iterations(self) -> u32 {
        match self {
            Self::ServerAuthorization => 1,
            Self::LocalAuthorization => 2,
        }
    }
}

/// Per-account unlock session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnlockState {
    #[default]
    Locked,
    Unlocking,
    Unlocked,
}
