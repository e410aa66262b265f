pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{DecryptFailure, VaultKeyError, VaultKeyResult};
pub use types::{HashPurpose, OrganizationId, ProviderId, UnlockState, UserId};
