//! View State Module
//!
//! The per-resource state machine every consumer view moves through.

use serde_json::Value;

use crate::error::SyncError;

// == View Data ==
/// The slice of data a view currently displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewData {
    /// Rows for the list/widget
    pub rows: Vec<Value>,
    /// Denormalized aggregate shown alongside the rows, when the view owns one
    pub aggregate: Option<u64>,
}

// == View State ==
/// State machine per resource instance.
///
/// `Idle` before mount; mounting moves to `Loading` on a cache miss or
/// straight to `Ready` on a hit. Change-feed or broadcast events move a
/// `Ready` view through `Refreshing` back to `Ready`. `Error` is terminal
/// until a manual retry. `Disposed` is entered on unmount and never left.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Idle,
    Loading,
    Ready(ViewData),
    /// Re-fetch in progress; carries the stale data still on screen.
    Refreshing(ViewData),
    Error(SyncError),
    Disposed,
}

impl ViewState {
    /// The displayable data, if any (fresh or stale).
    pub fn data(&self) -> Option<&ViewData> {
        match self {
            ViewState::Ready(data) | ViewState::Refreshing(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ViewState::Ready(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ViewState::Error(_))
    }
}
