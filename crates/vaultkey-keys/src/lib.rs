//! vaultkey-keys: key hierarchy manager, per-account key cache and device trust
//!
//! Persistence goes through [`Storage`], which splits state into two tiers:
//!   1. Disk: wrapped keys, key hash, encrypted org/provider maps
//!   2. Secure: raw device keys and auto-unlock user keys (platform keychain)
//!
//! Decrypted keys never leave the per-account [`AccountKeys`] cache.

pub mod cache;
pub mod device;
pub mod hierarchy;
pub mod keychain;
pub mod models;
pub mod singleflight;
pub mod state;

pub use cache::{AccountKeys, KeyCacheArena};
pub use device::{DeviceRegistry, DeviceResponse, DeviceTrustService, TrustedDeviceKeysRequest};
pub use hierarchy::{protect_key, KeyService};
pub use keychain::KeychainStore;
pub use models::{
    EncryptedOrganizationKey, ProfileOrganization, ProfileProvider, ProfileProviderOrganization,
    ProtectedPin,
};
pub use singleflight::SingleFlight;
pub use state::{JsonFileStore, MemoryStore, Scope, StateStore, Storage, StorageLocation, Tier};
