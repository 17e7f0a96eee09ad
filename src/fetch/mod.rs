//! Fetch Module
//!
//! Deduplicates concurrent fetches so at most one request is in flight per
//! query key at any time.

mod dedup;

pub use dedup::FetchDeduplicator;
