//! Per-key async mutual exclusion
//!
//! Callers are serialized independently: holding the lock for `alice` never
//! blocks `bob`. An entry lives only while someone holds or waits for it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive access to one key; releasing the last one removes the entry
pub struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map entry and `self.mutex` remain unless someone is waiting
        self.locks.remove_if(&self.key, |_, m| {
            Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2
        });
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. The guard can be moved into a spawned task.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = Arc::clone(&mutex).lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            mutex,
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
        }
    }

    /// Whether someone currently holds the lock for `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}
