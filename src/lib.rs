//! feedsync - Client-side realtime cache-and-sync layer
//!
//! Keeps UI-bound copies of server-derived state (row lists, denormalized
//! counts) consistent with a backend that can change at any time from any
//! client. Reads go through a process-wide TTL cache and a fetch deduplicator;
//! freshness comes from change-feed subscriptions (shared per resource scope)
//! and a broadcast relay that lets sibling views pick up recomputed aggregates
//! without their own round-trips.

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod key;
pub mod relay;
pub mod tasks;
pub mod view;

pub use client::SyncClient;
pub use config::Config;
pub use error::{Result, SyncError};
pub use key::QueryKey;
pub use tasks::spawn_sweep_task;
