//! In-process keyed lock

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{Lock, LockGuard};
use crate::error::Result;

type Slot = Arc<AsyncMutex<()>>;

/// Keyed FIFO mutex shared by every task of this process.
///
/// Offers no protection against other processes writing the same store.
#[derive(Clone, Default)]
pub struct ProcessLock {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the in-process slot of `key`; waiters are served in arrival order
    pub(crate) async fn acquire_slot(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            // Nobody holds or waits on a slot whose only reference is the map itself
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Lock for ProcessLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let slot = self.acquire_slot(key).await;
        Ok(LockGuard::new(key, slot, None))
    }
}
