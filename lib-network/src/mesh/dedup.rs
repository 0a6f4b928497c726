//! Frame deduplication cache
//!
//! The single gate deciding "have we handled this frame already". Keyed by
//! the frame hash (sender || message id || fragment index), bounded by both
//! entry count (LRU eviction) and age (sweep eviction), whichever bites
//! first. Flood routing depends on this cache for loop suppression.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use lib_crypto::Hash;

pub struct DedupCache {
    seen: LruCache<Hash, Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        DedupCache {
            seen: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            ttl,
        }
    }

    /// Returns true when the hash was already present (and fresh); inserts
    /// it otherwise. One call covers both the check and the record step of
    /// the relay pipeline.
    pub fn seen_or_insert(&mut self, hash: Hash, now: Instant) -> bool {
        match self.seen.get(&hash) {
            Some(inserted) if now.duration_since(*inserted) < self.ttl => true,
            _ => {
                self.seen.put(hash, now);
                false
            }
        }
    }

    /// Drop entries older than the ttl; returns how many were removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let expired: Vec<Hash> = self
            .seen
            .iter()
            .filter(|(_, inserted)| now.duration_since(**inserted) >= ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.seen.pop(hash);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
