//! LRU cache bounded by byte size and entry count
//!
//! This module provides a generic recency cache that tracks both the number of
//! entries and their total byte footprint, evicting least-recently-used entries
//! whenever either budget would be exceeded. There is no internal locking; the
//! owning service serializes all access.

use crate::buffer::ByteSize;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

type ChangeCallback<K> = Box<dyn FnMut(&[K], &[K]) + Send>;

/// A recency-ordered cache with byte and count budgets
///
/// Values are shared (`Arc`) so a retrieved thumbnail stays valid for its
/// holder even after the cache evicts it.
pub struct BoundedRecencyCache<K: Hash + Eq, V> {
    // Front is most recently used; the unbounded `lru` list only tracks order,
    // budgets are enforced here.
    entries: ::lru::LruCache<K, (Arc<V>, usize)>,
    size: usize,
    max_size: usize,
    max_count: usize,
    on_change: Option<ChangeCallback<K>>,
}

impl<K: Clone + Hash + Eq, V: ByteSize> BoundedRecencyCache<K, V> {
    /// Create a new cache with the specified byte and count budgets
    pub fn new(max_size: usize, max_count: usize) -> Self {
        Self {
            entries: ::lru::LruCache::unbounded(),
            size: 0,
            max_size,
            max_count,
            on_change: None,
        }
    }

    /// Register the single membership-change callback, replacing any previous one
    ///
    /// The callback receives `(stored, erased)` keys each time membership changes.
    pub fn bind_change_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&[K], &[K]) + Send + 'static,
    {
        self.on_change = Some(Box::new(callback));
    }

    /// Insert a value, evicting old entries if necessary
    ///
    /// Storing an existing key only refreshes its recency. Returns false when
    /// the value cannot fit the budget even in an empty cache; nothing is
    /// evicted in that case.
    pub fn store(&mut self, key: K, value: Arc<V>) -> bool {
        if self.entries.contains(&key) {
            self.entries.promote(&key);
            return true;
        }

        let byte_size = value.size();
        if byte_size > self.max_size || self.max_count == 0 {
            debug!(
                byte_size,
                max_size = self.max_size,
                max_count = self.max_count,
                "value does not fit cache budget"
            );
            return false;
        }

        self.shrink(self.max_size - byte_size, self.max_count - 1);

        self.entries.put(key.clone(), (value, byte_size));
        self.size += byte_size;
        self.notify(&[key], &[]);
        true
    }

    /// Get a value, making it the most recently used
    pub fn retrieve(&mut self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|(value, _)| Arc::clone(value))
    }

    /// Refresh recency without reading the value
    pub fn preserve(&mut self, key: &K) -> bool {
        if self.entries.contains(key) {
            self.entries.promote(key);
            true
        } else {
            false
        }
    }

    /// Remove one key, returning whether it was present
    pub fn erase(&mut self, key: &K) -> bool {
        match self.entries.pop(key) {
            Some((_, byte_size)) => {
                self.size -= byte_size;
                self.notify(&[], std::slice::from_ref(key));
                true
            }
            None => false,
        }
    }

    /// Erase several keys, returning those that were actually present
    pub fn erase_many(&mut self, keys: &[K]) -> Vec<K> {
        let mut removed = Vec::new();
        for key in keys {
            if let Some((_, byte_size)) = self.entries.pop(key) {
                self.size -= byte_size;
                removed.push(key.clone());
            }
        }
        if !removed.is_empty() {
            self.notify(&[], &removed);
        }
        removed
    }

    /// Evict and return the least recently used value
    pub fn release(&mut self) -> Option<Arc<V>> {
        let (key, (value, byte_size)) = self.entries.pop_lru()?;
        self.size -= byte_size;
        self.notify(&[], &[key]);
        Some(value)
    }

    /// Drop every entry, reporting them all as erased
    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let erased = self.keys();
        self.entries.clear();
        self.size = 0;
        self.notify(&[], &erased);
    }

    /// Release entries until both targets are met; always succeeds
    pub fn shrink(&mut self, target_size: usize, target_count: usize) -> bool {
        while self.entries.len() > target_count {
            self.release();
        }
        while self.size > target_size {
            self.release();
        }
        true
    }

    /// Change the byte budget, evicting down to it immediately
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.shrink(self.max_size, self.max_count);
    }

    /// Change the entry budget, evicting down to it immediately
    pub fn set_max_count(&mut self, max_count: usize) {
        self.max_count = max_count;
        self.shrink(self.max_size, self.max_count);
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Membership test that leaves recency untouched
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Total bytes held
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of entries held
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Byte budget
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entry budget
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn notify(&mut self, stored: &[K], erased: &[K]) {
        if let Some(callback) = self.on_change.as_mut() {
            callback(stored, erased);
        }
    }
}

impl<K: Hash + Eq, V> fmt::Debug for BoundedRecencyCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedRecencyCache")
            .field("count", &self.entries.len())
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("max_count", &self.max_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn blob(len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0; len])
    }

    fn assert_within_budget<K: Clone + Hash + Eq>(cache: &BoundedRecencyCache<K, Vec<u8>>) {
        assert!(cache.size() <= cache.max_size());
        assert!(cache.count() <= cache.max_count());
    }

    #[test]
    fn test_basic_operations() {
        let mut cache = BoundedRecencyCache::new(100, 10);

        assert!(cache.store("key1", Arc::new(vec![1u8, 2, 3])));
        assert_eq!(cache.retrieve(&"key1").as_deref(), Some(&vec![1u8, 2, 3]));
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.size(), 3);

        assert!(cache.retrieve(&"key2").is_none());
        assert!(!cache.preserve(&"key2"));
        assert!(!cache.erase(&"key2"));
    }

    #[test]
    fn test_size_eviction() {
        let mut cache = BoundedRecencyCache::new(25, usize::MAX);

        cache.store("key1", blob(10));
        cache.store("key2", blob(10));
        cache.store("key3", blob(5));
        assert_eq!(cache.count(), 3);
        assert_eq!(cache.size(), 25);

        // key1 is the oldest and has to go
        cache.store("key4", blob(10));
        assert!(!cache.contains(&"key1"));
        assert!(cache.contains(&"key2"));
        assert!(cache.contains(&"key3"));
        assert!(cache.contains(&"key4"));
        assert_within_budget(&cache);
    }

    #[test]
    fn test_count_eviction_respects_recency() {
        let mut cache = BoundedRecencyCache::new(usize::MAX, 2);

        cache.store("A", blob(1));
        cache.store("B", blob(1));
        cache.store("C", blob(1));
        assert_eq!(cache.keys(), vec!["C", "B"]);

        cache.retrieve(&"B");
        cache.store("D", blob(1));
        assert_eq!(cache.keys(), vec!["D", "B"]);
    }

    #[test]
    fn test_preserve_protects_from_eviction() {
        let mut cache = BoundedRecencyCache::new(usize::MAX, 3);

        cache.store(1, blob(1));
        cache.store(2, blob(1));
        cache.store(3, blob(1));

        assert!(cache.preserve(&1));
        cache.store(4, blob(1));

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_restore_existing_key_is_idempotent() {
        let mut cache = BoundedRecencyCache::new(50, 10);

        cache.store("key1", blob(10));
        cache.store("key2", blob(10));
        assert!(cache.store("key1", blob(30)));

        assert_eq!(cache.count(), 2);
        assert_eq!(cache.size(), 20);
        assert_eq!(cache.keys(), vec!["key1", "key2"]);
        // The original value stays
        assert_eq!(cache.retrieve(&"key1").map(|v| v.len()), Some(10));
    }

    #[test]
    fn test_oversized_value_is_rejected() {
        let mut cache = BoundedRecencyCache::new(10, 10);
        cache.store("small", blob(4));

        assert!(!cache.store("huge", blob(11)));
        assert!(cache.contains(&"small"));
        assert_eq!(cache.size(), 4);

        let mut no_room = BoundedRecencyCache::new(10, 0);
        assert!(!no_room.store("any", blob(1)));
        assert!(no_room.is_empty());
    }

    #[test]
    fn test_erase_many_reports_removed() {
        let mut cache = BoundedRecencyCache::new(100, 10);
        cache.store(1, blob(5));
        cache.store(2, blob(5));

        let removed = cache.erase_many(&[2, 3, 1]);
        assert_eq!(removed, vec![2, 1]);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_release_takes_oldest() {
        let mut cache = BoundedRecencyCache::new(100, 10);
        cache.store("old", blob(7));
        cache.store("new", blob(3));

        let released = cache.release().expect("cache not empty");
        assert_eq!(released.len(), 7);
        assert_eq!(cache.keys(), vec!["new"]);
        assert_eq!(cache.size(), 3);

        cache.release();
        assert!(cache.release().is_none());
    }

    #[test]
    fn test_set_budgets_shrink_immediately() {
        let mut cache = BoundedRecencyCache::new(100, 10);
        for i in 0..5 {
            cache.store(i, blob(10));
        }

        cache.set_max_count(3);
        assert_eq!(cache.keys(), vec![4, 3, 2]);

        cache.set_max_size(15);
        assert_eq!(cache.keys(), vec![4]);
        assert_within_budget(&cache);

        cache.set_max_size(0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = BoundedRecencyCache::new(100, 10);
        cache.store("key1", blob(10));
        cache.store("key2", blob(15));

        cache.clear();

        assert_eq!(cache.count(), 0);
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_change_callback_reports_membership() {
        let log: Arc<Mutex<Vec<(Vec<u32>, Vec<u32>)>>> = Arc::default();
        let mut cache = BoundedRecencyCache::new(usize::MAX, 2);
        {
            let log = Arc::clone(&log);
            cache.bind_change_callback(move |stored, erased| {
                log.lock().push((stored.to_vec(), erased.to_vec()));
            });
        }

        cache.store(1, blob(1));
        cache.store(2, blob(1));
        cache.store(1, blob(1)); // refresh only
        cache.store(3, blob(1)); // evicts 2
        cache.erase(&1);
        cache.clear();

        let log = log.lock();
        assert_eq!(
            *log,
            vec![
                (vec![1], vec![]),
                (vec![2], vec![]),
                (vec![], vec![2]),
                (vec![3], vec![]),
                (vec![], vec![1]),
                (vec![], vec![3]),
            ]
        );
    }

    #[test]
    fn test_budget_holds_across_mixed_operations() {
        let mut cache = BoundedRecencyCache::new(64, 6);

        for step in 0..200usize {
            let key = step % 17;
            match step % 5 {
                0 | 1 | 2 => {
                    cache.store(key, blob(step % 23 + 1));
                }
                3 => {
                    cache.erase(&(key / 2));
                }
                _ => {
                    cache.set_max_size(40 + step % 40);
                    cache.set_max_count(2 + step % 6);
                }
            }
            assert_within_budget(&cache);
            assert_eq!(cache.keys().len(), cache.count());
        }
    }
}
