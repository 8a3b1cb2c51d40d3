// ===============================
// src/locks.rs (per-key exclusive locks)
// ===============================
//
// Two tiers:
// - the map mutex (parking_lot) is held only to fetch-or-insert an entry,
//   never across an await and never while a per-key lock is being waited on;
// - the per-key lock (tokio Mutex, owned guard) is what callers actually hold.
//
// Entries are created lazily and never removed.
//
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};

use crate::domain::UserId;

pub struct LockRegistry<K = UserId> {
    entries: Mutex<HashMap<K, Arc<KeyMutex<()>>>>,
}

impl<K> LockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn entry(&self, key: &K) -> Arc<KeyMutex<()>> {
        let mut map = self.entries.lock();
        map.entry(key.clone()).or_insert_with(|| Arc::new(KeyMutex::new(()))).clone()
    }

    /// Waits until the caller holds the lock for `key`. Different keys never wait on each other.
    pub async fn acquire(&self, key: K) -> LockGuard<K> {
        let lock = self.entry(&key);
        let guard = lock.lock_owned().await;
        LockGuard { key, _guard: guard }
    }

    /// Non-blocking variant; `None` when another holder has the key.
    pub fn try_acquire(&self, key: K) -> Option<LockGuard<K>> {
        let lock = self.entry(&key);
        lock.try_lock_owned().ok().map(|guard| LockGuard { key, _guard: guard })
    }

    /// Number of keys seen so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for LockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the lock for one key. Released by `release()` or on drop
/// (unwinding included); a guard can only be released once.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<K> {
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K> LockGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn release(self) {
        drop(self)
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for LockGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}
