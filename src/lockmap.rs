//! The striped per-key mutex map (spec §4.5).
//!
//! Used by [`crate::store::Store`] to serialise operations on a single
//! record without blocking unrelated keys, and available to the
//! reconciler for per-machine mutual exclusion. An entry exists only while
//! at least one holder or waiter references it; once idle it is evicted so
//! the map doesn't grow without bound across the lifetime of the process.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct KeyEntry {
    /// `true` while a writer holds the key exclusively.
    held: Mutex<bool>,
    /// Signaled whenever `held` or the reader count changes.
    cond: Condvar,
    writer_cnt: AtomicUsize,
    reader_cnt: AtomicUsize,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cond: Condvar::new(),
            writer_cnt: AtomicUsize::new(0),
            reader_cnt: AtomicUsize::new(0),
        }
    }

    fn idle(&self) -> bool {
        self.writer_cnt.load(Ordering::SeqCst) == 0 && self.reader_cnt.load(Ordering::SeqCst) == 0
    }
}

/// A lock-striping map keyed by `K`. Cheap to clone; clones share the same
/// underlying table.
#[derive(Clone)]
pub struct LockMap<K: Eq + Hash + Clone> {
    entries: Arc<Mutex<HashMap<K, Arc<KeyEntry>>>>,
}

impl<K: Eq + Hash + Clone> Default for LockMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LockMap<K> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry_for(&self, key: &K) -> Arc<KeyEntry> {
        let mut table = self.entries.lock();
        table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyEntry::new()))
            .clone()
    }

    fn evict_if_idle(&self, key: &K, entry: &Arc<KeyEntry>) {
        if !entry.idle() {
            return;
        }
        let mut table = self.entries.lock();
        if let Some(current) = table.get(key) {
            if Arc::ptr_eq(current, entry) && entry.idle() {
                table.remove(key);
            }
        }
    }

    /// Acquire the key exclusively, blocking the calling thread until no
    /// writer and no readers hold it.
    pub fn lock(&self, key: K) -> KeyGuard<K> {
        let entry = self.entry_for(&key);
        entry.writer_cnt.fetch_add(1, Ordering::SeqCst);
        {
            let mut held = entry.held.lock();
            while *held || entry.reader_cnt.load(Ordering::SeqCst) > 0 {
                entry.cond.wait(&mut held);
            }
            *held = true;
        }
        KeyGuard {
            map: self.clone(),
            key,
            entry,
        }
    }

    /// Acquire the key for shared (reader) access. Reserved for future use
    /// by collaborators that only need to observe a record, not mutate it.
    pub fn rlock(&self, key: K) -> KeyReadGuard<K> {
        let entry = self.entry_for(&key);
        // Readers wait for any writer to release before counting themselves in,
        // so a writer can never be starved out by a steady stream of readers.
        {
            let held = entry.held.lock();
            let mut held = held;
            while *held {
                entry.cond.wait(&mut held);
            }
        }
        entry.reader_cnt.fetch_add(1, Ordering::SeqCst);
        KeyReadGuard {
            map: self.clone(),
            key,
            entry,
        }
    }

    /// Number of current holders+waiters for `key` (0 if untracked).
    pub fn count(&self, key: &K) -> usize {
        let table = self.entries.lock();
        table
            .get(key)
            .map(|e| e.writer_cnt.load(Ordering::SeqCst) + e.reader_cnt.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of keys with at least one tracked holder/waiter.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard for an exclusive [`LockMap::lock`] hold.
pub struct KeyGuard<K: Eq + Hash + Clone> {
    map: LockMap<K>,
    key: K,
    entry: Arc<KeyEntry>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        {
            let mut held = self.entry.held.lock();
            *held = false;
        }
        self.entry.writer_cnt.fetch_sub(1, Ordering::SeqCst);
        self.entry.cond.notify_all();
        self.map.evict_if_idle(&self.key, &self.entry);
    }
}

/// RAII guard for a shared [`LockMap::rlock`] hold.
pub struct KeyReadGuard<K: Eq + Hash + Clone> {
    map: LockMap<K>,
    key: K,
    entry: Arc<KeyEntry>,
}

impl<K: Eq + Hash + Clone> Drop for KeyReadGuard<K> {
    fn drop(&mut self) {
        let remaining = self.entry.reader_cnt.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.entry.cond.notify_all();
        }
        self.map.evict_if_idle(&self.key, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn exclusive_lock_serialises_writers() {
        let map: LockMap<String> = LockMap::new();
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _g = map.lock("m1".to_string());
                let before = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(before, counter.load(Ordering::SeqCst) - 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn idle_entries_are_evicted() {
        let map: LockMap<String> = LockMap::new();
        {
            let _g = map.lock("m1".to_string());
            assert_eq!(map.len(), 1);
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn unrelated_keys_do_not_contend() {
        let map: LockMap<String> = LockMap::new();
        let _g1 = map.lock("a".to_string());
        let g2 = map.lock("b".to_string());
        drop(g2);
        assert_eq!(map.count(&"a".to_string()), 1);
    }
}
