//! Aggregate Recomputation Module
//!
//! Client-held aggregates (comment counts, like counts) are caches of a
//! server-computed truth. When multiple independent writers can change the
//! underlying set, increment/decrement drifts under interleaving and
//! soft-deletes, so the authoritative value is always re-derived from storage
//! with an exact head-count and written back onto the parent record's
//! denormalized counter.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::{Filter, QueryBackend};
use crate::error::{Result, SyncError};

// == Aggregate Spec ==
/// Describes a denormalized counter: which child set to count and where on
/// the parent record to persist it.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    /// Table holding the counted rows (e.g. `comments`)
    pub child_table: String,
    /// Filter selecting the counted set; call sites exclude soft-deleted rows
    /// here (`is_null("deleted_at")`)
    pub child_filter: Filter,
    /// Table holding the parent record (e.g. `tweets`)
    pub parent_table: String,
    /// Id of the parent record
    pub parent_id: String,
    /// Column on the parent carrying the denormalized count
    /// (e.g. `replies_count`)
    pub counter_column: String,
}

impl AggregateSpec {
    // == Topic ==
    /// Broadcast topic on which recomputed values for this aggregate are
    /// announced.
    pub fn topic(&self) -> String {
        format!("counts:{}:{}", self.parent_table, self.parent_id)
    }
}

// == Recompute ==
/// Re-derives the aggregate from authoritative storage and persists it onto
/// the parent record. Returns the fresh count.
///
/// The denormalized write is allowed to fail: the in-memory count is still
/// correct for display and the stored counter stays stale until the next
/// successful recompute. Permission errors are the exception; they indicate a
/// logic bug and always propagate.
///
/// Idempotent by construction: invoking it twice for the same event yields
/// the same persisted value, which is what makes at-least-once change-feed
/// delivery safe.
pub async fn recompute(query: &dyn QueryBackend, spec: &AggregateSpec) -> Result<u64> {
    let count = query.count(&spec.child_table, &spec.child_filter).await?;

    let mut patch = serde_json::Map::new();
    patch.insert(spec.counter_column.clone(), json!(count));
    match query
        .update(&spec.parent_table, &spec.parent_id, Value::Object(patch))
        .await
    {
        Ok(()) => {
            debug!(
                parent = %spec.parent_id,
                column = %spec.counter_column,
                count,
                "denormalized counter persisted"
            );
        }
        Err(err @ SyncError::PermissionDenied(_)) => return Err(err),
        Err(err) => {
            warn!(
                parent = %spec.parent_id,
                column = %spec.counter_column,
                error = %err,
                "counter write failed, stale value tolerated until next recompute"
            );
        }
    }

    Ok(count)
}

// == Count Hint ==
/// Extracts a count from a broadcast payload of the shape
/// `{"resource_id": ..., "count": N}`. Returns `None` for malformed payloads,
/// which consumers treat as "no hint".
pub fn count_hint(payload: &Value) -> Option<u64> {
    payload.get("count").and_then(Value::as_u64)
}
