//! Change-Feed Module
//!
//! Wraps the backend's row-level change notifications behind a subscription
//! manager that keys by resource scope: however many views watch the same
//! scope, at most one transport subscription exists process-wide, shared via
//! reference counting and a per-scope fan-out channel.

mod manager;

pub use manager::{FeedManager, FeedSubscription};

use crate::backend::{EventKind, Filter};

// == Resource Scope ==
/// A logical partition of a table's change feed, e.g. one tweet's comments.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceScope {
    pub table: String,
    pub filter: Filter,
}

impl ResourceScope {
    pub fn new(table: impl Into<String>, filter: Filter) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    /// Canonical key used to deduplicate subscriptions for the same scope.
    pub fn key(&self) -> String {
        format!("{}?{}", self.table, self.filter.canonical())
    }
}

// == Event Filter ==
/// Which mutation kinds a subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == EventKind::Insert,
            EventFilter::Update => kind == EventKind::Update,
            EventFilter::Delete => kind == EventKind::Delete,
        }
    }
}
