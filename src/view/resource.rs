//! Resource View Module
//!
//! A list/widget bound to one resource: it loads through the shared cache,
//! watches the resource's change-feed scope, and, when it owns an aggregate,
//! recomputes and re-broadcasts the count on every event so sibling views
//! update without their own round-trips.
//!
//! All continuations check a liveness flag before touching view state:
//! unmounting releases every subscription synchronously and in-flight fetches
//! are allowed to complete but their results are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::aggregate::{count_hint, AggregateSpec};
use crate::backend::{ChangeEvent, Filter};
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::feed::{EventFilter, ResourceScope};
use crate::key::QueryKey;
use crate::view::{ViewData, ViewState};

// == View Spec ==
/// Everything a view needs to know about its resource.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    /// Cache key for the view's row query
    pub key: QueryKey,
    /// Table the rows live in
    pub table: String,
    /// Filter selecting the view's rows
    pub filter: Filter,
    /// Cache TTL tier for the rows
    pub ttl: Duration,
    /// Which change-feed events trigger a refresh
    pub events: EventFilter,
    /// Denormalized counter owned by this view, if any
    pub aggregate: Option<AggregateSpec>,
}

struct ViewInner {
    client: Arc<SyncClient>,
    spec: ViewSpec,
    alive: AtomicBool,
    state: watch::Sender<ViewState>,
}

impl ViewInner {
    /// State updates are dropped once the view is disposed. `send_replace`
    /// records the transition even while no receiver exists, so an observer
    /// attaching later sees the current state rather than a stale one.
    fn set_state(&self, state: ViewState) {
        if self.alive.load(Ordering::SeqCst) {
            self.state.send_replace(state);
        }
    }

    fn current_data(&self) -> Option<ViewData> {
        self.state.borrow().data().cloned()
    }

    /// Initial load: a cache hit renders immediately, a miss goes Loading and
    /// fetches through the deduplicator.
    async fn load_initial(&self) {
        if let Some(value) = self.client.cache().get(&self.spec.key) {
            let aggregate = self.initial_aggregate().await;
            self.set_state(ViewState::Ready(ViewData {
                rows: rows_of(value),
                aggregate,
            }));
            return;
        }

        self.set_state(ViewState::Loading);
        let fetched = self
            .client
            .fetch_rows(&self.spec.key, &self.spec.table, &self.spec.filter, self.spec.ttl)
            .await;
        match fetched {
            Ok(value) => {
                let aggregate = self.initial_aggregate().await;
                self.set_state(ViewState::Ready(ViewData {
                    rows: rows_of(value),
                    aggregate,
                }));
            }
            Err(err) => {
                // Nothing has ever loaded; the error is visible until retry.
                warn!(key = %self.spec.key, error = %err, "initial load failed");
                self.set_state(ViewState::Error(err));
            }
        }
    }

    /// Reads the denormalized counter off the parent record, avoiding a count
    /// query on mount. Missing or unreadable counters just start out blank.
    async fn initial_aggregate(&self) -> Option<u64> {
        let agg = self.spec.aggregate.as_ref()?;
        let filter = Filter::new().eq("id", agg.parent_id.clone());
        match self.client.query().query(&agg.parent_table, &filter).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get(&agg.counter_column))
                .and_then(Value::as_u64),
            Err(err) => {
                warn!(parent = %agg.parent_id, error = %err, "denormalized counter read failed");
                None
            }
        }
    }

    /// Reaction to a change-feed event: invalidate, re-fetch through the
    /// deduplicator, recompute the aggregate and announce it. The recompute
    /// is keyed by the triggering event so sibling views sharing the
    /// aggregate drive it once, not once each.
    async fn refresh(&self, event: &ChangeEvent) {
        let stale = self.current_data();
        if let Some(data) = &stale {
            self.set_state(ViewState::Refreshing(data.clone()));
        }

        self.client.invalidate(&self.spec.key);
        let fetched = self
            .client
            .fetch_rows(&self.spec.key, &self.spec.table, &self.spec.filter, self.spec.ttl)
            .await;
        let rows = match fetched {
            Ok(value) => rows_of(value),
            Err(err @ SyncError::PermissionDenied(_)) => {
                error!(key = %self.spec.key, error = %err, "refresh rejected by backend");
                self.set_state(ViewState::Error(err));
                return;
            }
            Err(err) => {
                match stale {
                    Some(data) => {
                        // Keep showing what we have; the next event retries.
                        warn!(key = %self.spec.key, error = %err, "refresh failed, keeping stale data");
                        self.set_state(ViewState::Ready(data));
                    }
                    None => self.set_state(ViewState::Error(err)),
                }
                return;
            }
        };

        let aggregate = match &self.spec.aggregate {
            Some(agg) => match self
                .client
                .recompute_aggregate(agg, event.occurred_at)
                .await
            {
                Ok(count) => Some(count),
                Err(err @ SyncError::PermissionDenied(_)) => {
                    error!(parent = %agg.parent_id, error = %err, "recompute rejected by backend");
                    self.set_state(ViewState::Error(err));
                    return;
                }
                Err(err) => {
                    warn!(parent = %agg.parent_id, error = %err, "recompute failed, keeping stale count");
                    stale.as_ref().and_then(|data| data.aggregate)
                }
            },
            None => stale.as_ref().and_then(|data| data.aggregate),
        };

        self.set_state(ViewState::Ready(ViewData { rows, aggregate }));
    }

    /// A broadcast count is a display hint only: update the aggregate on
    /// whatever is on screen, never fetch or persist in response.
    fn apply_count_hint(&self, count: u64) {
        let updated = match &*self.state.borrow() {
            ViewState::Ready(data) => ViewState::Ready(ViewData {
                rows: data.rows.clone(),
                aggregate: Some(count),
            }),
            ViewState::Refreshing(data) => ViewState::Refreshing(ViewData {
                rows: data.rows.clone(),
                aggregate: Some(count),
            }),
            _ => return,
        };
        self.set_state(updated);
    }
}

fn rows_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        other => vec![other],
    }
}

// == Resource View ==
/// UI-bound state holder for one resource instance.
pub struct ResourceView {
    inner: Arc<ViewInner>,
    tasks: Vec<JoinHandle<()>>,
    mounted: bool,
}

impl ResourceView {
    // == Constructor ==
    pub fn new(client: Arc<SyncClient>, spec: ViewSpec) -> Self {
        let (state, _) = watch::channel(ViewState::Idle);
        Self {
            inner: Arc::new(ViewInner {
                client,
                spec,
                alive: AtomicBool::new(true),
                state,
            }),
            tasks: Vec::new(),
            mounted: false,
        }
    }

    // == State ==
    /// Watch handle the rendering layer observes.
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.inner.state.subscribe()
    }

    // == Mount ==
    /// Loads the view and starts its subscriptions. Idempotent.
    pub async fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }

        self.inner.load_initial().await;

        // Establish both subscriptions before spawning anything, so a failure
        // here drops what was acquired and leaves the view fully unmounted
        // and retryable.
        let scope = ResourceScope::new(self.inner.spec.table.clone(), self.inner.spec.filter.clone());
        let mut feed_sub = self
            .inner
            .client
            .feed()
            .subscribe(&scope, self.inner.spec.events)
            .await?;
        let relay_sub = match &self.inner.spec.aggregate {
            Some(agg) => Some(self.inner.client.relay().subscribe(&agg.topic()).await?),
            None => None,
        };

        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = feed_sub.recv().await {
                if !inner.alive.load(Ordering::SeqCst) {
                    break;
                }
                inner.refresh(&event).await;
            }
        }));

        if let Some(mut relay_sub) = relay_sub {
            let inner = self.inner.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(message) = relay_sub.recv().await {
                    if !inner.alive.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(count) = count_hint(&message.payload) {
                        inner.apply_count_hint(count);
                    }
                }
            }));
        }

        self.mounted = true;
        Ok(())
    }

    // == Retry ==
    /// Manual retry out of the terminal `Error` state.
    pub async fn retry(&self) {
        if self.inner.state.borrow().is_error() {
            self.inner.load_initial().await;
        }
    }

    // == Unmount ==
    /// Releases all subscriptions and disposes the view. Any in-flight fetch
    /// still resolves but no-ops against the liveness flag.
    pub fn unmount(&mut self) {
        if !self.inner.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        // Aborting the listener tasks drops their subscriptions, which
        // releases the shared channels.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.inner.state.send_replace(ViewState::Disposed);
        self.mounted = false;
    }
}

impl Drop for ResourceView {
    fn drop(&mut self) {
        self.unmount();
    }
}
