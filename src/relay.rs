//! Broadcast Relay Module
//!
//! Topic-keyed pub/sub over the broadcast transport, for application-level
//! facts that do not correspond 1:1 to a database row change (e.g. "count
//! for resource X is now N"), so every open view showing that fact updates
//! without each independently recomputing it.
//!
//! One underlying transport channel exists per topic, shared by reference
//! counting exactly like the change-feed scopes. Payloads are hints: a
//! consumer that also persists the fact must re-verify by recomputation,
//! because delivery is unordered across publishers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{BroadcastMessage, BroadcastTransport, ChannelHandle};
use crate::error::Result;

struct TopicEntry {
    tx: broadcast::Sender<BroadcastMessage>,
    handle: Mutex<ChannelHandle>,
    subscribers: AtomicUsize,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct RelayInner {
    transport: Arc<dyn BroadcastTransport>,
    topics: DashMap<String, Arc<TopicEntry>>,
    capacity: usize,
}

impl RelayInner {
    /// Decrement and removal happen under the shard write lock as one step,
    /// so a concurrent subscribe can never join an entry that is about to be
    /// torn down.
    fn release(&self, topic: &str) {
        let removed = self.topics.remove_if(topic, |_, entry| {
            entry.subscribers.fetch_sub(1, Ordering::SeqCst) == 1
        });
        if let Some((_, entry)) = removed {
            if let Some(pump) = lock(&entry.pump).take() {
                pump.abort();
            }
            let handle = *lock(&entry.handle);
            self.transport.close_channel(handle);
            debug!(topic, "broadcast topic released");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// == Broadcast Relay ==
/// Process-wide registry of broadcast topics.
pub struct BroadcastRelay {
    inner: Arc<RelayInner>,
}

impl BroadcastRelay {
    /// Creates a relay over the given transport. `capacity` bounds each
    /// topic's fan-out channel.
    pub fn new(transport: Arc<dyn BroadcastTransport>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                transport,
                topics: DashMap::new(),
                capacity,
            }),
        }
    }

    // == Publish ==
    /// Sends `payload` to every subscriber of `topic`, across processes and
    /// tabs. When this process holds no channel for the topic, a transient
    /// one is opened for the send and closed again.
    pub async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        // Resolve the handle first so no map guard is held across the send.
        let shared = self
            .inner
            .topics
            .get(topic)
            .map(|entry| *lock(&entry.handle));
        if let Some(handle) = shared {
            return self.inner.transport.send(handle, event, payload).await;
        }

        let (sink, _source) = mpsc::unbounded_channel();
        let handle = self.inner.transport.open_channel(topic, sink).await?;
        let sent = self.inner.transport.send(handle, event, payload).await;
        self.inner.transport.close_channel(handle);
        sent
    }

    // == Subscribe ==
    /// Subscribes to a topic, sharing the underlying channel with any other
    /// local subscriber of the same topic.
    pub async fn subscribe(&self, topic: &str) -> Result<RelaySubscription> {
        if let Some(entry) = self.inner.topics.get(topic) {
            entry.subscribers.fetch_add(1, Ordering::SeqCst);
            debug!(topic, "joining shared broadcast topic");
            return Ok(RelaySubscription::new(
                self.inner.clone(),
                topic.to_string(),
                entry.tx.subscribe(),
            ));
        }

        let (sink, source) = mpsc::unbounded_channel();
        let handle = self.inner.transport.open_channel(topic, sink).await?;
        let (tx, _) = broadcast::channel(self.inner.capacity);
        let entry = Arc::new(TopicEntry {
            tx: tx.clone(),
            handle: Mutex::new(handle),
            subscribers: AtomicUsize::new(1),
            pump: Mutex::new(None),
        });

        match self.inner.topics.entry(topic.to_string()) {
            Entry::Occupied(existing) => {
                self.inner.transport.close_channel(handle);
                let winner = existing.get();
                winner.subscribers.fetch_add(1, Ordering::SeqCst);
                return Ok(RelaySubscription::new(
                    self.inner.clone(),
                    topic.to_string(),
                    winner.tx.subscribe(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        let topic_owned = topic.to_string();
        let pump = tokio::spawn(pump(topic_owned.clone(), entry.clone(), source));
        *lock(&entry.pump) = Some(pump);
        debug!(topic, "broadcast topic opened");

        Ok(RelaySubscription::new(
            self.inner.clone(),
            topic_owned,
            tx.subscribe(),
        ))
    }

    // == Active Topics ==
    /// Number of topics with an open shared channel.
    pub fn active_topics(&self) -> usize {
        self.inner.topics.len()
    }
}

async fn pump(
    topic: String,
    entry: Arc<TopicEntry>,
    mut source: mpsc::UnboundedReceiver<BroadcastMessage>,
) {
    while let Some(message) = source.recv().await {
        let _ = entry.tx.send(message);
    }
    // Broadcast delivery is best-effort; a dropped channel degrades to
    // recompute-on-next-event rather than resubscribing here.
    warn!(topic = %topic, "broadcast channel closed by transport");
}

// == Relay Subscription ==
/// A consumer's handle on a shared broadcast topic.
pub struct RelaySubscription {
    inner: Arc<RelayInner>,
    topic: String,
    rx: broadcast::Receiver<BroadcastMessage>,
    released: bool,
}

impl RelaySubscription {
    fn new(
        inner: Arc<RelayInner>,
        topic: String,
        rx: broadcast::Receiver<BroadcastMessage>,
    ) -> Self {
        Self {
            inner,
            topic,
            rx,
            released: false,
        }
    }

    // == Recv ==
    /// Next message on the topic, or `None` once the topic is torn down.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "broadcast subscriber lagged");
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
            self.inner.release(&self.topic);
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        let mut sub = relay.subscribe("counts:tweets:t1").await.unwrap();
        relay
            .publish("counts:tweets:t1", "count", json!({"count": 3}))
            .await
            .unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.event, "count");
        assert_eq!(message.payload["count"], 3);
    }

    #[tokio::test]
    async fn test_topic_channel_is_shared() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        let mut a = relay.subscribe("counts:tweets:t1").await.unwrap();
        let mut b = relay.subscribe("counts:tweets:t1").await.unwrap();

        assert_eq!(backend.open_channel_count(), 1);

        relay
            .publish("counts:tweets:t1", "count", json!({"count": 1}))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().payload["count"], 1);
        assert_eq!(b.recv().await.unwrap().payload["count"], 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_leaves_no_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        relay
            .publish("counts:tweets:t1", "count", json!({"count": 1}))
            .await
            .unwrap();

        assert_eq!(backend.open_channel_count(), 0);
        assert_eq!(relay.active_topics(), 0);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_the_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        let a = relay.subscribe("counts:tweets:t1").await.unwrap();
        let b = relay.subscribe("counts:tweets:t1").await.unwrap();

        a.unsubscribe();
        assert_eq!(backend.open_channel_count(), 1);

        b.unsubscribe();
        assert_eq!(backend.open_channel_count(), 0);
        assert_eq!(relay.active_topics(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churned_topic_still_delivers() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = Arc::new(BroadcastRelay::new(backend.clone(), 16));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                let sub = relay.subscribe("counts:tweets:t1").await.unwrap();
                tokio::task::yield_now().await;
                sub.unsubscribe();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut sub = relay.subscribe("counts:tweets:t1").await.unwrap();
        assert_eq!(backend.open_channel_count(), 1);
        relay
            .publish("counts:tweets:t1", "count", json!({"count": 2}))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().payload["count"], 2);
    }

    #[tokio::test]
    async fn test_messages_keep_per_publisher_order() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        let mut sub = relay.subscribe("counts:tweets:t1").await.unwrap();
        for n in 1..=5 {
            relay
                .publish("counts:tweets:t1", "count", json!({"count": n}))
                .await
                .unwrap();
        }

        for n in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().payload["count"], n);
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = BroadcastRelay::new(backend.clone(), 16);

        let mut t1 = relay.subscribe("counts:tweets:t1").await.unwrap();
        let _t2 = relay.subscribe("counts:tweets:t2").await.unwrap();

        relay
            .publish("counts:tweets:t2", "count", json!({"count": 9}))
            .await
            .unwrap();
        relay
            .publish("counts:tweets:t1", "count", json!({"count": 1}))
            .await
            .unwrap();

        // t1 sees only its own topic's message.
        assert_eq!(t1.recv().await.unwrap().payload["count"], 1);
    }
}
