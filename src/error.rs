//! Error types for the cache-and-sync layer
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Sync Error Enum ==
/// Unified error type for the cache-and-sync layer.
///
/// Variants carry plain string payloads and the enum derives `Clone` so a
/// single failed fetch can be shared with every waiter of a deduplicated
/// request burst.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or backend temporarily unavailable; safe to retry on the next
    /// explicit user action or mount.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A change-feed or broadcast channel failed to establish or dropped.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The backend rejected the operation (row-level security). Indicates a
    /// logic bug rather than a transient condition; never silently swallowed.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Persisting a recomputed denormalized counter failed. The in-memory
    /// count remains usable; the stored counter stays stale until the next
    /// successful recompute.
    #[error("Aggregate write failed: {0}")]
    AggregateWrite(String),

    /// A row or payload could not be interpreted.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl SyncError {
    // == Is Transient ==
    /// Whether a retry without operator intervention can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Subscription(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidRow(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache-and-sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
