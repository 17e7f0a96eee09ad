//! Counter Badge Module
//!
//! A relay-only consumer: a badge showing a count somewhere else in the UI
//! (a reply counter next to a tweet, an unread bubble on a tab). It never
//! queries storage itself; it mirrors whatever count the views that own the
//! aggregate broadcast after recomputing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregate::count_hint;
use crate::client::SyncClient;
use crate::error::Result;

struct BadgeInner {
    count: watch::Sender<Option<u64>>,
    alive: AtomicBool,
}

// == Counter Badge ==
/// Broadcast-fed counter display.
pub struct CounterBadge {
    inner: Arc<BadgeInner>,
    task: Option<JoinHandle<()>>,
}

impl CounterBadge {
    // == Constructor ==
    /// `initial` seeds the display, typically a denormalized counter the
    /// caller already has on hand from the parent record.
    pub fn new(initial: Option<u64>) -> Self {
        let (count, _) = watch::channel(initial);
        Self {
            inner: Arc::new(BadgeInner {
                count,
                alive: AtomicBool::new(true),
            }),
            task: None,
        }
    }

    // == Count ==
    /// Watch handle the rendering layer observes.
    pub fn count(&self) -> watch::Receiver<Option<u64>> {
        self.inner.count.subscribe()
    }

    // == Mount ==
    /// Subscribes to the count topic. Idempotent.
    pub async fn mount(&mut self, client: &SyncClient, topic: &str) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let mut sub = client.relay().subscribe(topic).await?;
        let inner = self.inner.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                if !inner.alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(count) = count_hint(&message.payload) {
                    // Recorded even while no receiver exists, so an observer
                    // attaching later sees the latest count.
                    inner.count.send_replace(Some(count));
                }
            }
        }));
        Ok(())
    }

    // == Unmount ==
    /// Releases the topic subscription.
    pub fn unmount(&mut self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CounterBadge {
    fn drop(&mut self) {
        self.unmount();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::backend::MemoryBackend;
    use crate::config::Config;

    fn client() -> (Arc<MemoryBackend>, Arc<SyncClient>) {
        let backend = Arc::new(MemoryBackend::new());
        let client = SyncClient::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            Config::default(),
        );
        (backend, client)
    }

    #[tokio::test]
    async fn test_badge_mirrors_broadcast_counts() {
        let (backend, client) = client();
        let mut badge = CounterBadge::new(Some(0));
        badge.mount(&client, "counts:tweets:t1").await.unwrap();
        let mut count_rx = badge.count();

        client
            .relay()
            .publish("counts:tweets:t1", "count", json!({"resource_id": "t1", "count": 4}))
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                if *count_rx.borrow() == Some(4) {
                    return;
                }
                count_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("badge did not update");

        assert_eq!(backend.query_calls(), 0, "badge issues no queries");
        assert_eq!(backend.count_calls(), 0, "badge issues no count queries");
    }

    #[tokio::test]
    async fn test_count_recorded_without_an_observer() {
        let (_backend, client) = client();
        let mut badge = CounterBadge::new(None);
        badge.mount(&client, "counts:tweets:t1").await.unwrap();

        // No receiver is held while the broadcast arrives.
        client
            .relay()
            .publish("counts:tweets:t1", "count", json!({"resource_id": "t1", "count": 4}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*badge.count().borrow(), Some(4));
    }

    #[tokio::test]
    async fn test_badge_ignores_malformed_payloads() {
        let (_backend, client) = client();
        let mut badge = CounterBadge::new(Some(2));
        badge.mount(&client, "counts:tweets:t1").await.unwrap();

        client
            .relay()
            .publish("counts:tweets:t1", "count", json!({"resource_id": "t1"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*badge.count().borrow(), Some(2), "seed value untouched");
    }

    #[tokio::test]
    async fn test_unmounted_badge_stops_updating() {
        let (backend, client) = client();
        let mut badge = CounterBadge::new(None);
        badge.mount(&client, "counts:tweets:t1").await.unwrap();

        badge.unmount();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.open_channel_count(), 0);

        client
            .relay()
            .publish("counts:tweets:t1", "count", json!({"resource_id": "t1", "count": 9}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*badge.count().borrow(), None);
    }
}
