//! Change-Feed Subscription Manager
//!
//! Keys subscriptions by resource scope with reference counting: the first
//! subscriber establishes the transport subscription, later subscribers for
//! the same scope share it, and the underlying channel is released only when
//! the last subscriber unsubscribes. A transport disconnect while subscribers
//! remain triggers automatic resubscription with exponential backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use backoff::future::retry;
use backoff::ExponentialBackoff;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::{ChangeEvent, ChangeFeed, FeedHandle};
use crate::error::Result;
use crate::feed::{EventFilter, ResourceScope};

struct ScopeEntry {
    tx: broadcast::Sender<ChangeEvent>,
    handle: Mutex<FeedHandle>,
    subscribers: AtomicUsize,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct FeedInner {
    transport: Arc<dyn ChangeFeed>,
    scopes: DashMap<String, Arc<ScopeEntry>>,
    capacity: usize,
}

impl FeedInner {
    /// Decrements a scope's subscriber count; the last release tears down the
    /// transport subscription. The decrement and the removal happen under the
    /// shard write lock as one step, so a concurrent subscribe can never
    /// join an entry that is about to be torn down.
    fn release(&self, key: &str) {
        let removed = self.scopes.remove_if(key, |_, entry| {
            entry.subscribers.fetch_sub(1, Ordering::SeqCst) == 1
        });
        if let Some((_, entry)) = removed {
            if let Some(pump) = lock(&entry.pump).take() {
                pump.abort();
            }
            let handle = *lock(&entry.handle);
            self.transport.unsubscribe(handle);
            debug!(scope = key, "change feed released");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// == Feed Manager ==
/// Process-wide registry of change-feed subscriptions, one transport channel
/// per resource scope.
pub struct FeedManager {
    inner: Arc<FeedInner>,
}

impl FeedManager {
    /// Creates a manager over the given transport. `capacity` bounds each
    /// scope's fan-out channel.
    pub fn new(transport: Arc<dyn ChangeFeed>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                transport,
                scopes: DashMap::new(),
                capacity,
            }),
        }
    }

    // == Subscribe ==
    /// Subscribes to the scope's change feed. If the scope already has an
    /// active subscription the transport channel is shared; otherwise one is
    /// established.
    pub async fn subscribe(
        &self,
        scope: &ResourceScope,
        filter: EventFilter,
    ) -> Result<FeedSubscription> {
        let key = scope.key();

        if let Some(entry) = self.inner.scopes.get(&key) {
            entry.subscribers.fetch_add(1, Ordering::SeqCst);
            debug!(scope = %key, "joining shared change feed");
            return Ok(FeedSubscription::new(
                self.inner.clone(),
                key.clone(),
                filter,
                entry.tx.subscribe(),
            ));
        }

        // Establish the underlying channel before taking the map slot; on a
        // lost race the freshly-created subscription is torn down again.
        let (sink, source) = mpsc::unbounded_channel();
        let handle = self
            .inner
            .transport
            .subscribe_to_table(&scope.table, scope.filter.clone(), sink)
            .await?;
        let (tx, _) = broadcast::channel(self.inner.capacity);
        let entry = Arc::new(ScopeEntry {
            tx: tx.clone(),
            handle: Mutex::new(handle),
            subscribers: AtomicUsize::new(1),
            pump: Mutex::new(None),
        });

        match self.inner.scopes.entry(key.clone()) {
            Entry::Occupied(existing) => {
                self.inner.transport.unsubscribe(handle);
                let winner = existing.get();
                winner.subscribers.fetch_add(1, Ordering::SeqCst);
                return Ok(FeedSubscription::new(
                    self.inner.clone(),
                    key.clone(),
                    filter,
                    winner.tx.subscribe(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        let pump = spawn_pump(self.inner.clone(), scope.clone(), entry.clone(), source);
        *lock(&entry.pump) = Some(pump);
        debug!(scope = %key, "change feed established");

        Ok(FeedSubscription::new(
            self.inner.clone(),
            key,
            filter,
            tx.subscribe(),
        ))
    }

    // == Active Scopes ==
    /// Number of scopes with a live transport subscription.
    pub fn active_scopes(&self) -> usize {
        self.inner.scopes.len()
    }
}

/// Forwards transport events into the scope's fan-out channel and
/// resubscribes if the transport drops the sink while subscribers remain.
fn spawn_pump(
    inner: Arc<FeedInner>,
    scope: ResourceScope,
    entry: Arc<ScopeEntry>,
    mut source: mpsc::UnboundedReceiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Some(event) => {
                    // No receivers just means every subscriber is between
                    // polls; the send error is ignorable.
                    let _ = entry.tx.send(event);
                }
                None => {
                    if entry.subscribers.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    warn!(scope = %scope.key(), "change feed disconnected, resubscribing");
                    let (sink, new_source) = mpsc::unbounded_channel();
                    let resubscribed = retry(ExponentialBackoff::default(), || {
                        let transport = inner.transport.clone();
                        let table = scope.table.clone();
                        let filter = scope.filter.clone();
                        let sink = sink.clone();
                        async move {
                            transport
                                .subscribe_to_table(&table, filter, sink)
                                .await
                                .map_err(backoff::Error::transient)
                        }
                    })
                    .await;
                    match resubscribed {
                        Ok(handle) => {
                            *lock(&entry.handle) = handle;
                            source = new_source;
                            debug!(scope = %scope.key(), "change feed resubscribed");
                        }
                        Err(err) => {
                            // Subscribers keep their stale data; the scope is
                            // degraded until remounted.
                            error!(scope = %scope.key(), error = %err, "resubscription failed");
                            break;
                        }
                    }
                }
            }
        }
    })
}

// == Feed Subscription ==
/// A consumer's handle on a shared change-feed scope.
///
/// Events arrive through [`recv`](FeedSubscription::recv), already narrowed
/// by the subscriber's [`EventFilter`]. Dropping the subscription releases it
/// exactly once; [`unsubscribe`](FeedSubscription::unsubscribe) does the same
/// explicitly.
pub struct FeedSubscription {
    inner: Arc<FeedInner>,
    scope_key: String,
    filter: EventFilter,
    rx: broadcast::Receiver<ChangeEvent>,
    released: bool,
}

impl FeedSubscription {
    fn new(
        inner: Arc<FeedInner>,
        scope_key: String,
        filter: EventFilter,
        rx: broadcast::Receiver<ChangeEvent>,
    ) -> Self {
        Self {
            inner,
            scope_key,
            filter,
            rx,
            released: false,
        }
    }

    // == Recv ==
    /// Next matching event, or `None` once the scope is torn down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(event.kind) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // At-least-once delivery with idempotent consumers makes a
                    // lag gap safe; the next event triggers a full refresh.
                    warn!(scope = %self.scope_key, skipped, "change feed subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    // == Unsubscribe ==
    /// Releases the subscription explicitly.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.scope_key);
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::backend::{EventKind, Filter, MemoryBackend};

    fn scope(tweet_id: &str) -> ResourceScope {
        ResourceScope::new("comments", Filter::new().eq("tweet_id", tweet_id))
    }

    #[tokio::test]
    async fn test_same_scope_shares_one_transport_subscription() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let mut first = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
        let mut second = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();

        assert_eq!(backend.feed_subscription_count(), 1);
        assert_eq!(manager.active_scopes(), 1);

        backend
            .insert_row("comments", json!({"id": "c1", "tweet_id": "t1"}))
            .unwrap();

        assert_eq!(first.recv().await.unwrap().row["id"], "c1");
        assert_eq!(second.recv().await.unwrap().row["id"], "c1");
    }

    #[tokio::test]
    async fn test_distinct_scopes_get_distinct_subscriptions() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let _a = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
        let _b = manager.subscribe(&scope("t2"), EventFilter::All).await.unwrap();

        assert_eq!(backend.feed_subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_last_release_tears_down_the_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let first = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
        let second = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();

        first.unsubscribe();
        assert_eq!(backend.feed_subscription_count(), 1, "one subscriber remains");

        second.unsubscribe();
        assert_eq!(backend.feed_subscription_count(), 0);
        assert_eq!(manager.active_scopes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churned_scope_still_delivers() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = Arc::new(FeedManager::new(backend.clone(), 16));

        // Subscribe/release cycles racing across worker threads must never
        // strand a live subscriber on a torn-down entry.
        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let sub = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
                tokio::task::yield_now().await;
                sub.unsubscribe();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut sub = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
        assert_eq!(backend.feed_subscription_count(), 1);
        backend
            .insert_row("comments", json!({"id": "c1", "tweet_id": "t1"}))
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().row["id"], "c1");
    }

    #[tokio::test]
    async fn test_no_events_after_unsubscribe() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let mut sub = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();
        backend
            .insert_row("comments", json!({"id": "c1", "tweet_id": "t1"}))
            .unwrap();
        assert!(sub.recv().await.is_some());

        sub.unsubscribe();
        backend
            .insert_row("comments", json!({"id": "c2", "tweet_id": "t1"}))
            .unwrap();

        // The scope is gone; a new subscription sees only future events.
        assert_eq!(backend.feed_subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_event_filter_narrows_delivery() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let mut inserts_only = manager
            .subscribe(&scope("t1"), EventFilter::Insert)
            .await
            .unwrap();

        backend
            .insert_row("comments", json!({"id": "c1", "tweet_id": "t1"}))
            .unwrap();
        backend
            .update_row("comments", "c1", json!({"body": "edited"}))
            .unwrap();
        backend
            .insert_row("comments", json!({"id": "c2", "tweet_id": "t1"}))
            .unwrap();

        let first = inserts_only.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Insert);
        assert_eq!(first.row["id"], "c1");

        // The update is skipped; the next delivery is the second insert.
        let second = inserts_only.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Insert);
        assert_eq!(second.row["id"], "c2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_triggers_resubscription() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = FeedManager::new(backend.clone(), 16);

        let mut sub = manager.subscribe(&scope("t1"), EventFilter::All).await.unwrap();

        // The first transport subscription gets handle 1.
        backend.drop_feed(1);
        // Let the pump observe the closed sink and resubscribe.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(backend.feed_subscription_count(), 1);

        backend
            .insert_row("comments", json!({"id": "c1", "tweet_id": "t1"}))
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().row["id"], "c1");
    }
}
