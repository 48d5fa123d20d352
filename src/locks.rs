use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async mutexes. Mutating operations on the same agent, task, or
/// session serialize through one of these; distinct keys proceed in parallel.
///
/// Entries are never evicted: the key space is bounded by the number of
/// agents/tasks/sessions on a single host.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Non-blocking variant; `None` when another holder is active.
    pub async fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.try_lock_owned().ok()
    }
}
