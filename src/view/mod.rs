//! Consumer View Module
//!
//! UI-bound state holders. Each view owns a slice of cached data, subscribes
//! to the change feed and broadcast relay for its resource, and refreshes
//! through the shared cache and deduplicator. State is exposed through a
//! `tokio::sync::watch` channel so the rendering layer observes transitions
//! without polling.

mod badge;
mod resource;
mod state;

pub use badge::CounterBadge;
pub use resource::{ResourceView, ViewSpec};
pub use state::{ViewData, ViewState};
