//! Sync Client Module
//!
//! Bundles the process-wide pieces of the cache-and-sync layer: the one TTL
//! cache, the one fetch deduplicator, the change-feed manager, the broadcast
//! relay and the query backend. Consumer views are handed a shared
//! [`SyncClient`] and go through its public contracts only.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::aggregate::{recompute, AggregateSpec};
use crate::backend::{BroadcastTransport, ChangeFeed, Filter, QueryBackend};
use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::feed::FeedManager;
use crate::fetch::FetchDeduplicator;
use crate::key::QueryKey;
use crate::relay::BroadcastRelay;
use crate::tasks::spawn_sweep_task;

// == Sync Client ==
/// Shared entry point to the cache-and-sync layer; one instance per process.
pub struct SyncClient {
    cache: Arc<TtlCache>,
    dedup: FetchDeduplicator,
    feed: FeedManager,
    relay: BroadcastRelay,
    query: Arc<dyn QueryBackend>,
    config: Config,
}

impl SyncClient {
    // == Constructor ==
    /// Wires the layer over the three backend capabilities.
    pub fn new(
        query: Arc<dyn QueryBackend>,
        change_feed: Arc<dyn ChangeFeed>,
        broadcast: Arc<dyn BroadcastTransport>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: Arc::new(TtlCache::new(config.ttl_short())),
            dedup: FetchDeduplicator::new(),
            feed: FeedManager::new(change_feed, config.channel_capacity),
            relay: BroadcastRelay::new(broadcast, config.channel_capacity),
            query,
            config,
        })
    }

    // == Start ==
    /// Spawns the periodic cache sweep. Returns the task handle so callers
    /// can abort it on shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        spawn_sweep_task(self.cache.clone(), self.config.sweep_interval_secs)
    }

    // == Fetch Rows ==
    /// Reads rows through the cache: a fresh entry is returned without
    /// network access, a miss goes through the deduplicator so overlapping
    /// callers share a single query.
    pub async fn fetch_rows(
        &self,
        key: &QueryKey,
        table: &str,
        filter: &Filter,
        ttl: Duration,
    ) -> Result<Value> {
        self.fetch_with(key, ttl, || async {
            let rows = self.query.query(table, filter).await?;
            Ok(Value::Array(rows))
        })
        .await
    }

    // == Fetch With ==
    /// Same cached-and-deduplicated path with a caller-supplied producer.
    pub async fn fetch_with<F, Fut>(
        &self,
        key: &QueryKey,
        ttl: Duration,
        producer: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.cache.get(key) {
            return Ok(value);
        }
        debug!(key = %key, "cache miss, fetching");
        let value = self.dedup.get_or_fetch(key, producer).await?;
        self.cache.set(key.clone(), value.clone(), Some(ttl));
        Ok(value)
    }

    // == Recompute Aggregate ==
    /// Re-derives an aggregate from storage, persists it onto the parent
    /// record and announces it on the aggregate's topic.
    ///
    /// Keyed by the triggering event's timestamp: however many views own the
    /// same aggregate, one distinct change-feed event drives exactly one
    /// recompute and one broadcast. Later callers for the same event read the
    /// settled count from the cache.
    pub async fn recompute_aggregate(
        &self,
        spec: &AggregateSpec,
        event_at: DateTime<Utc>,
    ) -> Result<u64> {
        let key = QueryKey::builder("aggregate")
            .scope(spec.parent_table.as_str(), &spec.parent_id)
            .param("column", &spec.counter_column)
            .param("at", event_at.to_rfc3339())
            .build();
        let value = self
            .fetch_with(&key, self.config.ttl_short(), || async {
                let count = recompute(self.query.as_ref(), spec).await?;
                let payload = json!({ "resource_id": spec.parent_id, "count": count });
                if let Err(err) = self.relay.publish(&spec.topic(), "count", payload).await {
                    warn!(topic = %spec.topic(), error = %err, "count broadcast failed");
                }
                Ok(Value::from(count))
            })
            .await?;
        value
            .as_u64()
            .ok_or_else(|| SyncError::InvalidRow("cached aggregate is not a count".into()))
    }

    // == Invalidate ==
    /// Drops the cached value for a key; the next read will fetch.
    pub fn invalidate(&self, key: &QueryKey) {
        self.cache.invalidate(key);
    }

    // == Accessors ==
    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn feed(&self) -> &FeedManager {
        &self.feed
    }

    pub fn relay(&self) -> &BroadcastRelay {
        &self.relay
    }

    pub fn query(&self) -> &Arc<dyn QueryBackend> {
        &self.query
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
