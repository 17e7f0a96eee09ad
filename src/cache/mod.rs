//! Cache Module
//!
//! Provides the process-wide TTL cache for server-derived state.
//!
//! Entries are owned exclusively by the cache and only ever replaced
//! wholesale; expiry is lazy on read with a periodic sweep for cleanup.

mod entry;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub use stats::CacheStats;
pub use store::TtlCache;
