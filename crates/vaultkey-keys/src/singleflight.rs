//! Single-flight memo slot for decrypted key maps.
//!
//! The first reader to find the slot empty runs the decrypt pass while
//! holding the slot lock; readers arriving meanwhile wait on the lock and see
//! the published value instead of decrypting again. Writers null the slot
//! before persisting the new encrypted source, under the same lock.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use vaultkey_core::VaultKeyResult;

pub struct SingleFlight<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value, or run `init` and publish its result.
    ///
    /// `Ok(None)` from `init` is passed through without being cached, so the
    /// next reader retries.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> VaultKeyResult<Option<Arc<T>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VaultKeyResult<Option<T>>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            return Ok(Some(value.clone()));
        }

        match init().await? {
            Some(value) => {
                let value = Arc::new(value);
                *slot = Some(value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().await.clone()
    }

    pub async fn set(&self, value: T) {
        *self.slot.lock().await = Some(Arc::new(value));
    }

    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }

    /// Null the cached value, then run `persist` before any reader can
    /// repopulate it from the old source.
    pub async fn replace_source<F, Fut, R>(&self, persist: F) -> VaultKeyResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VaultKeyResult<R>>,
    {
        let mut slot = self.slot.lock().await;
        *slot = None;
        persist().await
    }
}
