//! Read cache of closed container bodies
//!
//! Restores usually walk a recipe in order, so consecutive chunks tend to live
//! in the same container. Keeping the last few containers in memory turns those
//! reads into slice copies. Least recently used entries are evicted first.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Bounded LRU of `container name -> full container bytes`.
#[derive(Debug)]
pub struct ReadCache {
    entries: LruCache<String, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl ReadCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Membership check that leaves the recency order alone.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Look up a container and mark it most recently used.
    pub fn get(&mut self, name: &str) -> Option<&[u8]> {
        match self.entries.get(name) {
            Some(body) => {
                self.hits += 1;
                Some(body.as_slice())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace a container body, evicting the oldest entry when full.
    pub fn insert(&mut self, name: String, body: Vec<u8>) {
        match self.entries.push(name, body) {
            // push hands back the old pair on replace too
            Some((evicted, _)) if !self.entries.contains(&evicted) => {
                tracing::trace!(container = %evicted, "read cache eviction");
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(1)
    }
}
