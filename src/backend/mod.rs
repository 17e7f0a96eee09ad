//! Backend Interfaces Module
//!
//! The cache-and-sync layer consumes three external capabilities, treated as
//! fixed collaborators: a query interface for reads and denormalized writes, a
//! change-feed interface for row-level mutation events, and a broadcast
//! transport for application-level pub/sub independent of database rows.
//!
//! All three are trait seams so tests and local development can run against
//! the in-process [`MemoryBackend`].

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

// == Filter ==
/// A single filter condition over a row's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Column equals the given value.
    Eq { column: String, value: Value },
    /// Column is absent or null. Used to exclude soft-deleted rows
    /// (`is_null("deleted_at")`).
    IsNull { column: String },
}

/// Equality/null filter over rows, matching the backend's server-side filter
/// expressions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Creates an empty filter matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    // == Eq ==
    /// Requires `column == value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    // == Is Null ==
    /// Requires `column` to be null or absent.
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(Condition::IsNull {
            column: column.into(),
        });
        self
    }

    // == Matches ==
    /// Evaluates the filter against a JSON row.
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|cond| match cond {
            Condition::Eq { column, value } => row.get(column) == Some(value),
            Condition::IsNull { column } => {
                matches!(row.get(column), None | Some(Value::Null))
            }
        })
    }

    // == Canonical Key ==
    /// Deterministic rendering used to key subscription scopes. Conditions are
    /// sorted by column so logically identical filters render identically.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self
            .conditions
            .iter()
            .map(|cond| match cond {
                Condition::Eq { column, value } => format!("{}={}", column, value),
                Condition::IsNull { column } => format!("{}=null", column),
            })
            .collect();
        parts.sort();
        parts.join("&")
    }
}

// == Change Events ==
/// Kind of row-level mutation carried by a change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// A row-level mutation notification pushed by the backend.
///
/// Delivery is at-least-once; consumers must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub table: String,
    /// The affected row. For deletes this is the last known row state.
    pub row: Value,
    pub occurred_at: DateTime<Utc>,
}

/// A message delivered over the broadcast transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Application-defined event name within the channel.
    pub event: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

// == Handles ==
/// Opaque handle for an established change-feed subscription.
pub type FeedHandle = u64;

/// Opaque handle for an open broadcast channel.
pub type ChannelHandle = u64;

// == Query Backend ==
/// Read and denormalized-write interface against authoritative storage.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Returns all rows of `table` matching `filter`.
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Exact head-count of rows matching `filter`, without materializing rows.
    async fn count(&self, table: &str, filter: &Filter) -> Result<u64>;

    /// Merges `patch` into the row identified by `id`.
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<()>;
}

// == Change Feed ==
/// Row-level change notification transport.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribes to insert/update/delete events on `table` matching `filter`,
    /// delivered into `sink`. Closing the sink without [`Self::unsubscribe`]
    /// signals a transport disconnect.
    async fn subscribe_to_table(
        &self,
        table: &str,
        filter: Filter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<FeedHandle>;

    /// Tears down a subscription. Synchronous; must be called exactly once per
    /// successful [`Self::subscribe_to_table`].
    fn unsubscribe(&self, handle: FeedHandle);
}

// == Broadcast Transport ==
/// Lightweight pub/sub transport independent of database rows.
///
/// Delivery is best-effort and ordered only per-topic-per-publisher.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Opens a named channel; messages sent to any channel with the same name
    /// are delivered into `sink`.
    async fn open_channel(
        &self,
        name: &str,
        sink: mpsc::UnboundedSender<BroadcastMessage>,
    ) -> Result<ChannelHandle>;

    /// Sends an event on an open channel.
    async fn send(&self, handle: ChannelHandle, event: &str, payload: Value) -> Result<()>;

    /// Closes a channel. Synchronous; idempotent on unknown handles.
    fn close_channel(&self, handle: ChannelHandle);
}
