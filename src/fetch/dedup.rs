//! Fetch Deduplicator Module
//!
//! Ensures at most one in-flight request per query key. The first caller of a
//! burst becomes the leader and runs the producer; concurrent callers for the
//! same key await the leader's shared result instead of issuing their own
//! request. Failures are never cached, so a failed fetch allows an immediate
//! retry with a fresh producer invocation.

use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::{Result, SyncError};
use crate::key::QueryKey;

type FetchResult = Result<Value>;

// == Fetch Deduplicator ==
/// Process-wide in-flight request registry.
#[derive(Debug, Default)]
pub struct FetchDeduplicator {
    pending: DashMap<QueryKey, broadcast::Sender<FetchResult>>,
}

/// Removes the pending slot when the leader settles, including on panic, so a
/// stuck key can always be retried.
struct PendingGuard<'a> {
    dedup: &'a FetchDeduplicator,
    key: QueryKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dedup.pending.remove(&self.key);
    }
}

impl FetchDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    // == Get Or Fetch ==
    /// Runs `producer` unless a fetch for `key` is already in flight, in which
    /// case the pending result is shared.
    ///
    /// The pending slot is removed on settlement (success or failure) before
    /// any waiter is resolved, so a caller arriving after settlement starts a
    /// fresh fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: &QueryKey, producer: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        let mut rx = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(slot) => {
                // Single waiter message; receivers subscribe before the send.
                let (tx, _) = broadcast::channel(1);
                slot.insert(tx.clone());
                let guard = PendingGuard {
                    dedup: self,
                    key: key.clone(),
                };
                trace!(key = %key, "fetch leader started");

                let result = producer().await;

                // Clear the pending slot first, then resolve the waiters.
                drop(guard);
                let _ = tx.send(result.clone());
                return result;
            }
        };

        debug!(key = %key, "joining in-flight fetch");
        match rx.recv().await {
            Ok(result) => result,
            // The leader was dropped before settling; retryable.
            Err(_) => Err(SyncError::Transient(format!(
                "in-flight fetch for `{}` was abandoned",
                key
            ))),
        }
    }

    // == In Flight ==
    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
