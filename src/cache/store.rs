//! Cache Store Module
//!
//! The process-wide TTL cache. One instance serves every consumer view;
//! concurrent `set`/`invalidate` on the same key are safe because both are
//! total replacements or removals, never partial mutations.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::cache::stats::StatsCounters;
use crate::cache::{CacheEntry, CacheStats};
use crate::key::QueryKey;

// == TTL Cache ==
/// Maps a [`QueryKey`] to a cached value with an expiry.
///
/// Expired entries are treated as misses on read and removed by the periodic
/// [`sweep`](TtlCache::sweep); the sweep is advisory cleanup, not
/// correctness-critical.
#[derive(Debug)]
pub struct TtlCache {
    entries: DashMap<QueryKey, CacheEntry>,
    stats: StatsCounters,
    /// TTL applied when `set` is called without an explicit duration
    default_ttl: Duration,
}

impl TtlCache {
    // == Constructor ==
    /// Creates a cache with the given default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stats: StatsCounters::default(),
            default_ttl,
        }
    }

    // == Get ==
    /// Returns the cached value if present and fresh (`now < expires_at`).
    /// Expired entries count as misses and are removed lazily here.
    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.stats.record_hit();
                return Some(entry.value.clone());
            }
        } else {
            self.stats.record_miss();
            return None;
        }
        // Expired: drop the read guard above before removing.
        self.entries.remove(key);
        self.stats.record_miss();
        None
    }

    // == Entry ==
    /// Returns the full entry (value plus timestamps) if fresh.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value().clone())
    }

    // == Set ==
    /// Stores a value, overwriting any previous entry for the key. `None`
    /// falls back to the cache's default TTL.
    pub fn set(&self, key: QueryKey, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    // == Invalidate ==
    /// Removes an entry immediately regardless of remaining TTL. Used when a
    /// change-feed event proves the cached value stale. Returns whether an
    /// entry was present.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.record_invalidation();
            trace!(key = %key, "cache invalidated");
        }
        removed
    }

    // == Sweep ==
    /// Removes all entries past expiry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            self.stats.record_swept(removed as u64);
        }
        removed
    }

    // == Stats ==
    /// Returns a snapshot of the cache's performance counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.len())
    }

    // == Length ==
    /// Current number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
