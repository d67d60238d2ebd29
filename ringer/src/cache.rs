//! Bounded LRU cache in front of the local store.
//!
//! Owned by the ring runtime, so access is plain `&mut self` with no lock.

use std::num::NonZeroUsize;

use tracing::trace;

/// Least-recently-used cache of string values.
///
/// A capacity of 0 disables caching entirely.
#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    entries: Option<lru::LruCache<String, String>>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: NonZeroUsize::new(capacity).map(lru::LruCache::new),
        }
    }

    /// Looks up a key and promotes it to most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<String> {
        self.entries.as_mut()?.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        if let Some((evicted, _)) = entries.push(key.to_string(), value.to_string()) {
            if evicted != key {
                trace!(key = %evicted, "evicted cached value");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, lru::LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
