//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.
//!
//! Entries are timestamped with [`tokio::time::Instant`] so tests can drive
//! expiry with the paused runtime clock instead of real timers.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

// == Cache Entry ==
/// A single cached value with its fetch time and expiry.
///
/// Entries are never mutated in place; a refresh replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub value: Value,
    /// When the value was fetched
    pub fetched_at: Instant,
    /// When the value stops being served
    pub expires_at: Instant,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry expiring `ttl` from now.
    pub fn new(value: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            fetched_at: now,
            expires_at: now + ttl,
        }
    }

    // == Is Expired ==
    /// An entry is expired once the current time reaches `expires_at`;
    /// `get` treats expired entries as misses.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    // == Time To Live ==
    /// Remaining TTL; zero once expired.
    pub fn ttl_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_entry_fresh_until_ttl_elapses() {
        let entry = CacheEntry::new(json!({"rows": []}), Duration::from_millis(5_000));

        assert!(!entry.is_expired());

        advance(Duration::from_millis(4_999)).await;
        assert!(!entry.is_expired());

        advance(Duration::from_millis(2)).await;
        assert!(entry.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_boundary() {
        let entry = CacheEntry::new(json!(1), Duration::from_millis(1_000));

        advance(Duration::from_millis(1_000)).await;
        assert!(entry.is_expired(), "entry expires exactly at the boundary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_remaining_counts_down() {
        let entry = CacheEntry::new(json!(1), Duration::from_millis(10_000));

        advance(Duration::from_millis(4_000)).await;
        assert_eq!(entry.ttl_remaining(), Duration::from_millis(6_000));

        advance(Duration::from_millis(20_000)).await;
        assert_eq!(entry.ttl_remaining(), Duration::ZERO);
    }
}
