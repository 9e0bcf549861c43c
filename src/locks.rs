//! Per-key async locks.
//!
//! An entry lives only while some task holds or waits for its key, so the
//! table stays as small as the set of keys in use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct KeyedLocks<K> {
    table: Table<K>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.clone()).or_default().clone()
        };

        KeyGuard {
            key,
            guard: Some(lock.lock_owned().await),
            table: self.table.clone(),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held access to one key. Dropping it releases the key and removes the
/// entry when no other task is waiting for it.
pub struct KeyGuard<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    table: Table<K>,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        self.guard.take();

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the table's own reference left: nobody holds or waits.
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}
