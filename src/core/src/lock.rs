//! Keyed mutexes for per-pod serialization.
//!
//! Operations against a single sandbox must run in order while unrelated
//! pods proceed in parallel, so a single global lock is out. Entries are
//! reference counted and dropped once the last guard for a key is
//! released, keeping the map bounded by the number of live pods.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<Mutex<()>>,
    refs: usize,
}

/// A map of reference-counted per-key async mutexes.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    entries: Arc<std::sync::Mutex<HashMap<String, Entry>>>,
}

/// Guard holding one key's lock; releasing it decrements the refcount.
pub struct KeyedGuard {
    _inner: OwnedMutexGuard<()>,
    key: String,
    entries: Arc<std::sync::Mutex<HashMap<String, Entry>>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier holders.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut entries = self.entries.lock().expect("lock map poisoned");
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.lock.clone()
        };

        let inner = lock.lock_owned().await;
        KeyedGuard {
            _inner: inner,
            key: key.to_string(),
            entries: self.entries.clone(),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
