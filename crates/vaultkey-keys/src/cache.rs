//! Per-account in-memory key cache.
//!
//! Every unlocked account owns one [`AccountKeys`]; accounts never share
//! mutable state. Decrypted material lives only here and is zeroized when
//! the cache is wiped or dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use vaultkey_core::{OrganizationId, ProviderId, UnlockState, UserId};
use vaultkey_crypto::{EncString, MasterKey, OrgKey, ProviderKey, UserKey};

use crate::singleflight::SingleFlight;

/// Decrypted keys for one account.
#[derive(Default)]
pub struct AccountKeys {
    pub(crate) state: RwLock<UnlockState>,
    pub(crate) master_key: RwLock<Option<MasterKey>>,
    pub(crate) user_key: RwLock<Option<UserKey>>,
    /// PIN-wrapped user key held for this session only
    pub(crate) ephemeral_pin_key: RwLock<Option<EncString>>,
    /// PKCS#8 DER
    pub(crate) private_key: SingleFlight<Zeroizing<Vec<u8>>>,
    /// SPKI DER
    pub(crate) public_key: SingleFlight<Vec<u8>>,
    pub(crate) org_keys: SingleFlight<HashMap<OrganizationId, OrgKey>>,
    pub(crate) provider_keys: SingleFlight<HashMap<ProviderId, ProviderKey>>,
}

impl AccountKeys {
    pub async fn state(&self) -> UnlockState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: UnlockState) {
        *self.state.write().await = state;
    }

    /// Drop every decrypted key. The unlock state is left to the caller.
    pub(crate) async fn wipe(&self) {
        *self.master_key.write().await = None;
        *self.user_key.write().await = None;
        *self.ephemeral_pin_key.write().await = None;
        self.private_key.clear().await;
        self.public_key.clear().await;
        self.org_keys.clear().await;
        self.provider_keys.clear().await;
    }
}

/// Arena of per-account caches keyed by user id.
#[derive(Default)]
pub struct KeyCacheArena {
    accounts: RwLock<HashMap<UserId, Arc<AccountKeys>>>,
}

impl KeyCacheArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for `user`, created empty and `Locked` on first use.
    pub async fn open(&self, user: &UserId) -> Arc<AccountKeys> {
        if let Some(keys) = self.accounts.read().await.get(user) {
            return keys.clone();
        }
        self.accounts
            .write()
            .await
            .entry(user.clone())
            .or_default()
            .clone()
    }

    pub async fn get(&self, user: &UserId) -> Option<Arc<AccountKeys>> {
        self.accounts.read().await.get(user).cloned()
    }

    /// Wipe and forget the cache for `user`. Handles still held elsewhere
    /// observe the wiped, locked state.
    pub async fn clear(&self, user: &UserId) {
        let removed = self.accounts.write().await.remove(user);
        if let Some(keys) = removed {
            keys.wipe().await;
            keys.set_state(UnlockState::Locked).await;
            tracing::debug!(user = %user, "cleared in-memory keys");
        }
    }

    pub async fn open_accounts(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.accounts.read().await.keys().cloned().collect();
        users.sort();
        users
    }
}
