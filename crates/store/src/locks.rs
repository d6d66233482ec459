use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async mutex per string key. Holders of different keys never contend.
///
/// Slots are held weakly, so a key with no outstanding guard costs nothing
/// once the map is pruned.
#[derive(Default)]
pub struct KeyedMutex {
    slots: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

pub type KeyedGuard = OwnedMutexGuard<()>;

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = self.slot(key);
        slot.lock_owned().await
    }

    /// Number of keys currently tracked, including ones awaiting pruning.
    pub fn tracked(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        slots.retain(|_, slot| slot.strong_count() > 0);
        let fresh = Arc::new(AsyncMutex::new(()));
        slots.insert(key.to_string(), Arc::downgrade(&fresh));
        fresh
    }
}
