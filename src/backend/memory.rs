//! In-Process Backend
//!
//! Implements all three backend interfaces against in-memory tables. Used by
//! the test suites and for local development; row mutations emit change-feed
//! events to matching subscribers the way the hosted backend does, and
//! broadcast sends fan out to every open channel with the same name
//! (the sender's own channel included).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::backend::{
    BroadcastMessage, BroadcastTransport, ChangeEvent, ChangeFeed, ChannelHandle, EventKind,
    FeedHandle, Filter, QueryBackend,
};
use crate::error::{Result, SyncError};

struct FeedSub {
    table: String,
    filter: Filter,
    sink: mpsc::UnboundedSender<ChangeEvent>,
}

struct ChannelSub {
    name: String,
    sink: mpsc::UnboundedSender<BroadcastMessage>,
}

// == Memory Backend ==
/// In-process implementation of [`QueryBackend`], [`ChangeFeed`] and
/// [`BroadcastTransport`].
#[derive(Default)]
pub struct MemoryBackend {
    /// table name -> row id -> row
    tables: DashMap<String, HashMap<String, Value>>,
    feeds: DashMap<FeedHandle, FeedSub>,
    channels: DashMap<ChannelHandle, ChannelSub>,
    next_handle: AtomicU64,
    query_calls: AtomicU64,
    count_calls: AtomicU64,
    /// When set, every update fails with a clone of this error.
    update_error: Mutex<Option<SyncError>>,
    /// When set, every query fails with a clone of this error.
    query_error: Mutex<Option<SyncError>>,
    /// When set, every query sleeps before answering.
    query_delay: Mutex<Option<Duration>>,
    /// When set, every open_channel fails with a clone of this error.
    open_channel_error: Mutex<Option<SyncError>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn row_id(row: &Value) -> Result<String> {
        row.get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SyncError::InvalidRow("row is missing a string `id`".into()))
    }

    fn emit(&self, kind: EventKind, table: &str, row: &Value) {
        for sub in self.feeds.iter() {
            if sub.table == table && sub.filter.matches(row) {
                // A closed sink means the subscriber went away without
                // unsubscribing; the event is simply dropped.
                let _ = sub.sink.send(ChangeEvent {
                    kind,
                    table: table.to_string(),
                    row: row.clone(),
                    occurred_at: Utc::now(),
                });
            }
        }
    }

    // == Row Mutations ==
    /// Inserts a row (which must carry a string `id`) and notifies matching
    /// change-feed subscribers. This is how tests simulate writes from other
    /// clients.
    pub fn insert_row(&self, table: &str, row: Value) -> Result<()> {
        let id = Self::row_id(&row)?;
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
        self.emit(EventKind::Insert, table, &row);
        Ok(())
    }

    /// Merges `patch` into an existing row and notifies subscribers.
    pub fn update_row(&self, table: &str, id: &str, patch: Value) -> Result<()> {
        let updated = {
            let mut rows = self
                .tables
                .get_mut(table)
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", table, id)))?;
            let row = rows
                .get_mut(id)
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", table, id)))?;
            merge_patch(row, &patch)?;
            row.clone()
        };
        self.emit(EventKind::Update, table, &updated);
        Ok(())
    }

    /// Removes a row and notifies subscribers with its last known state.
    pub fn delete_row(&self, table: &str, id: &str) -> Result<()> {
        let removed = self
            .tables
            .get_mut(table)
            .and_then(|mut rows| rows.remove(id))
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", table, id)))?;
        self.emit(EventKind::Delete, table, &removed);
        Ok(())
    }

    /// Returns a row by id, if present.
    pub fn get_row(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.get(table)?.get(id).cloned()
    }

    // == Test Instrumentation ==
    /// Number of `count` calls served so far.
    pub fn count_calls(&self) -> u64 {
        self.count_calls.load(Ordering::Relaxed)
    }

    /// Number of `query` calls served so far.
    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::Relaxed)
    }

    /// Number of live change-feed subscriptions.
    pub fn feed_subscription_count(&self) -> usize {
        self.feeds.len()
    }

    /// Number of open broadcast channels.
    pub fn open_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Makes every subsequent update fail with `error` until cleared with
    /// `None`.
    pub fn set_update_error(&self, error: Option<SyncError>) {
        *self.update_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Makes every subsequent query fail with `error` until cleared with
    /// `None`.
    pub fn set_query_error(&self, error: Option<SyncError>) {
        *self.query_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Delays every subsequent query by `delay`, simulating a slow network.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Makes every subsequent open_channel fail with `error` until cleared
    /// with `None`.
    pub fn set_open_channel_error(&self, error: Option<SyncError>) {
        *self
            .open_channel_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Drops a feed subscription's sink without removing it through
    /// [`ChangeFeed::unsubscribe`], simulating a transport disconnect.
    pub fn drop_feed(&self, handle: FeedHandle) {
        self.feeds.remove(&handle);
    }
}

#[async_trait]
impl QueryBackend for MemoryBackend {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.query_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self
            .query_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        let rows = match self.tables.get(table) {
            Some(rows) => rows
                .values()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(rows)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        self.count_calls.fetch_add(1, Ordering::Relaxed);
        let n = match self.tables.get(table) {
            Some(rows) => rows.values().filter(|row| filter.matches(row)).count(),
            None => 0,
        };
        Ok(n as u64)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<()> {
        if let Some(err) = self
            .update_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        self.update_row(table, id, patch)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe_to_table(
        &self,
        table: &str,
        filter: Filter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<FeedHandle> {
        let handle = self.next_handle();
        self.feeds.insert(
            handle,
            FeedSub {
                table: table.to_string(),
                filter,
                sink,
            },
        );
        trace!(handle, table, "change feed subscribed");
        Ok(handle)
    }

    fn unsubscribe(&self, handle: FeedHandle) {
        self.feeds.remove(&handle);
        trace!(handle, "change feed unsubscribed");
    }
}

#[async_trait]
impl BroadcastTransport for MemoryBackend {
    async fn open_channel(
        &self,
        name: &str,
        sink: mpsc::UnboundedSender<BroadcastMessage>,
    ) -> Result<ChannelHandle> {
        if let Some(err) = self
            .open_channel_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        let handle = self.next_handle();
        self.channels.insert(
            handle,
            ChannelSub {
                name: name.to_string(),
                sink,
            },
        );
        trace!(handle, name, "broadcast channel opened");
        Ok(handle)
    }

    async fn send(&self, handle: ChannelHandle, event: &str, payload: Value) -> Result<()> {
        let name = self
            .channels
            .get(&handle)
            .map(|c| c.name.clone())
            .ok_or_else(|| SyncError::Subscription(format!("unknown channel {}", handle)))?;
        let message = BroadcastMessage {
            event: event.to_string(),
            payload,
            sent_at: Utc::now(),
        };
        for sub in self.channels.iter() {
            if sub.name == name {
                let _ = sub.sink.send(message.clone());
            }
        }
        Ok(())
    }

    fn close_channel(&self, handle: ChannelHandle) {
        self.channels.remove(&handle);
        trace!(handle, "broadcast channel closed");
    }
}

fn merge_patch(row: &mut Value, patch: &Value) -> Result<()> {
    let patch = patch
        .as_object()
        .ok_or_else(|| SyncError::InvalidRow("update patch must be an object".into()))?;
    let target = row
        .as_object_mut()
        .ok_or_else(|| SyncError::InvalidRow("stored row is not an object".into()))?;
    for (column, value) in patch {
        target.insert(column.clone(), value.clone());
    }
    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_applies_filter() {
        let backend = MemoryBackend::new();
        backend
            .insert_row("comments", json!({"id": "1", "tweet_id": "t1"}))
            .unwrap();
        backend
            .insert_row("comments", json!({"id": "2", "tweet_id": "t2"}))
            .unwrap();

        let rows = backend
            .query("comments", &Filter::new().eq("tweet_id", "t1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "1");
    }

    #[tokio::test]
    async fn test_count_excludes_soft_deleted() {
        let backend = MemoryBackend::new();
        backend
            .insert_row("comments", json!({"id": "1", "tweet_id": "t1"}))
            .unwrap();
        backend
            .insert_row(
                "comments",
                json!({"id": "2", "tweet_id": "t1", "deleted_at": "2024-01-01"}),
            )
            .unwrap();

        let filter = Filter::new().eq("tweet_id", "t1").is_null("deleted_at");
        assert_eq!(backend.count("comments", &filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_notifies_matching_subscriber() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend
            .subscribe_to_table("comments", Filter::new().eq("tweet_id", "t1"), tx)
            .await
            .unwrap();

        backend
            .insert_row("comments", json!({"id": "1", "tweet_id": "t1"}))
            .unwrap();
        backend
            .insert_row("comments", json!({"id": "2", "tweet_id": "other"}))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Insert);
        assert_eq!(event.row["id"], "1");
        assert!(rx.try_recv().is_err(), "non-matching row must not notify");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = backend
            .subscribe_to_table("comments", Filter::new(), tx)
            .await
            .unwrap();

        backend.unsubscribe(handle);
        backend
            .insert_row("comments", json!({"id": "1"}))
            .unwrap();

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_by_name() {
        let backend = MemoryBackend::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();

        let a = backend.open_channel("counts:tweets:t1", tx_a).await.unwrap();
        backend.open_channel("counts:tweets:t1", tx_b).await.unwrap();
        backend.open_channel("counts:tweets:t2", tx_other).await.unwrap();

        backend.send(a, "count", json!({"count": 3})).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload["count"], 3);
        assert_eq!(rx_b.recv().await.unwrap().payload["count"], 3);
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_error_injection() {
        let backend = MemoryBackend::new();
        backend
            .insert_row("tweets", json!({"id": "t1", "replies_count": 0}))
            .unwrap();
        backend.set_update_error(Some(SyncError::PermissionDenied("rls".into())));

        let result = backend
            .update("tweets", "t1", json!({"replies_count": 1}))
            .await;
        assert_eq!(result, Err(SyncError::PermissionDenied("rls".into())));

        backend.set_update_error(None);
        backend
            .update("tweets", "t1", json!({"replies_count": 1}))
            .await
            .unwrap();
        assert_eq!(backend.get_row("tweets", "t1").unwrap()["replies_count"], 1);
    }
}
