//! Query subscriptions with stale-time revalidation.
//!
//! A [`QuerySubscription`] owns one query+variables pair. It moves through
//! `Idle -> Fetching -> Ready`, and when a stale time is set, a single timer
//! sends it back to `Fetching` for a background refetch while the last good
//! data stays visible. `clear` ends in `Evicted`.

use blueprint_core::{
    BlueprintError, BlueprintResult, FetchPolicy, QueryConfig, QueryRequest, Scheduler,
    TimerHandle,
};
use blueprint_memo::DeepMemo;
use blueprint_storage::AccessTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::client::QueryClient;
use crate::spawn_background;

// ============================================================================
// OPTIONS AND SNAPSHOTS
// ============================================================================

/// How to run one subscription.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub request: QueryRequest,
    /// Revalidate this long after each successful fetch. Falls back to
    /// [`QueryConfig::default_stale_time`].
    pub stale_time: Option<Duration>,
    /// Issue one extra network-only fetch at start, alongside the normal read.
    pub prefetch_on_mount: bool,
    pub fetch_policy: FetchPolicy,
}

impl QueryOptions {
    pub fn new(request: QueryRequest) -> Self {
        Self {
            request,
            stale_time: None,
            prefetch_on_mount: false,
            fetch_policy: FetchPolicy::default(),
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_prefetch_on_mount(mut self, enabled: bool) -> Self {
        self.prefetch_on_mount = enabled;
        self
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    #[default]
    Idle,
    Fetching,
    Ready,
    Evicted,
}

/// What a UI reads for one subscription.
#[derive(Debug, Clone, Default)]
pub struct QuerySnapshot {
    /// Last good result. Never cleared by a failed fetch.
    pub data: Option<Value>,
    pub loading: bool,
    pub error: Option<BlueprintError>,
    /// The stale timer fired and no revalidation has succeeded since.
    pub is_stale: bool,
    pub phase: QueryPhase,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Creates query subscriptions that share one client, tracker and scheduler.
#[derive(Clone)]
pub struct QueryCacheManager {
    client: QueryClient,
    tracker: Arc<AccessTracker>,
    scheduler: Arc<dyn Scheduler>,
    config: QueryConfig,
}

impl QueryCacheManager {
    pub fn new(
        client: QueryClient,
        tracker: Arc<AccessTracker>,
        scheduler: Arc<dyn Scheduler>,
        config: QueryConfig,
    ) -> Self {
        Self {
            client,
            tracker,
            scheduler,
            config,
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn tracker(&self) -> &Arc<AccessTracker> {
        &self.tracker
    }

    /// Create an idle subscription without fetching.
    pub fn subscribe(&self, options: QueryOptions) -> QuerySubscription {
        let mut request_memo = DeepMemo::new();
        let request = options.request.clone();
        let variables = request.variables.clone();
        request_memo.get(std::slice::from_ref(&variables), || request);

        let (snapshot, _) = watch::channel(QuerySnapshot::default());
        let inner = Arc::new(SubscriptionInner {
            id: Uuid::now_v7(),
            query: options.request.query.clone(),
            client: self.client.clone(),
            tracker: Arc::clone(&self.tracker),
            scheduler: Arc::clone(&self.scheduler),
            stale_time: options.stale_time.or(self.config.default_stale_time),
            fetch_policy: options.fetch_policy,
            gc_on_clear: self.config.gc_on_clear,
            state: Mutex::new(SubscriptionState {
                request_memo,
                timer: None,
                issued: 0,
                applied: 0,
                closed: false,
            }),
            snapshot,
        });
        tracing::debug!(
            subscription = %inner.id,
            query = %inner.query,
            stale_time_ms = inner.stale_time.map(|d| d.as_millis() as u64),
            "Query subscription created"
        );
        QuerySubscription { inner }
    }

    /// Create a subscription and run its initial fetch.
    ///
    /// An initial failure does not fail the call; it is recorded on the
    /// snapshot, where the UI reads it. Use [`subscribe`](Self::subscribe)
    /// and [`QuerySubscription::fetch`] to receive it as a `Result` instead.
    pub async fn start(&self, options: QueryOptions) -> QuerySubscription {
        let prefetch_on_mount = options.prefetch_on_mount;
        let subscription = self.subscribe(options);

        if prefetch_on_mount {
            let client = self.client.clone();
            let request = subscription.request();
            spawn_background("mount prefetch", async move {
                if let Err(err) = client.execute(&request, FetchPolicy::NetworkOnly).await {
                    let err = BlueprintError::prefetch(request.cache_key(), err);
                    tracing::debug!(error = %err, "Mount prefetch failed");
                }
            });
        }

        if let Err(err) = subscription.fetch().await {
            tracing::debug!(
                subscription = %subscription.id(),
                error = %err,
                "Initial fetch failed"
            );
        }
        subscription
    }
}

impl fmt::Debug for QueryCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

struct SubscriptionState {
    /// Current request; rebuilt only when variables deep-change.
    request_memo: DeepMemo<QueryRequest>,
    /// At most one pending stale timer.
    timer: Option<TimerHandle>,
    /// Generation of the latest issued fetch.
    issued: u64,
    /// Generation of the latest fetch applied to the snapshot.
    applied: u64,
    closed: bool,
}

impl SubscriptionState {
    fn request(&self) -> Option<&QueryRequest> {
        self.request_memo.peek()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct SubscriptionInner {
    id: Uuid,
    query: String,
    client: QueryClient,
    tracker: Arc<AccessTracker>,
    scheduler: Arc<dyn Scheduler>,
    stale_time: Option<Duration>,
    fetch_policy: FetchPolicy,
    gc_on_clear: bool,
    state: Mutex<SubscriptionState>,
    snapshot: watch::Sender<QuerySnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Foreground,
    Revalidation,
}

impl SubscriptionInner {
    fn lock(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_request(&self) -> QueryRequest {
        self.lock()
            .request()
            .cloned()
            .unwrap_or_else(|| QueryRequest::named(self.query.clone()))
    }

    async fn run_fetch(
        self: &Arc<Self>,
        policy: FetchPolicy,
        kind: FetchKind,
    ) -> BlueprintResult<Value> {
        let (request, generation) = {
            let mut state = self.lock();
            state.cancel_timer();
            state.issued += 1;
            let request = state
                .request()
                .cloned()
                .unwrap_or_else(|| QueryRequest::named(self.query.clone()));
            (request, state.issued)
        };

        let cached = match policy {
            FetchPolicy::CacheAndNetwork => self.client.read_cached(&request),
            _ => None,
        };
        self.snapshot.send_modify(|snapshot| {
            snapshot.loading = true;
            snapshot.phase = QueryPhase::Fetching;
            if kind == FetchKind::Revalidation {
                snapshot.is_stale = true;
            }
            if cached.is_some() {
                snapshot.data = cached;
            }
        });

        let result = self.client.execute(&request, policy).await;

        let mut state = self.lock();
        if generation <= state.applied || state.closed {
            tracing::debug!(
                subscription = %self.id,
                generation,
                applied = state.applied,
                "Ignoring superseded fetch completion"
            );
            return result.map(|outcome| outcome.data);
        }
        state.applied = generation;
        let settled = generation == state.issued;

        match result {
            Ok(outcome) => {
                self.tracker.record_all(&outcome.entities);
                let data = outcome.data.clone();
                self.snapshot.send_modify(|snapshot| {
                    snapshot.data = Some(outcome.data);
                    snapshot.error = None;
                    snapshot.is_stale = false;
                    snapshot.loading = !settled;
                    snapshot.phase = if settled {
                        QueryPhase::Ready
                    } else {
                        QueryPhase::Fetching
                    };
                    snapshot.updated_at = Some(Utc::now());
                });
                self.arm_stale_timer(&mut state);
                Ok(data)
            }
            Err(err) => {
                let has_data = self.snapshot.borrow().data.is_some();
                let recorded = match kind {
                    FetchKind::Revalidation => {
                        tracing::warn!(
                            subscription = %self.id,
                            query = %request.cache_key(),
                            error = %err,
                            "Background refetch failed, keeping last good data"
                        );
                        BlueprintError::background(err.clone())
                    }
                    FetchKind::Foreground => err.clone(),
                };
                self.snapshot.send_modify(|snapshot| {
                    snapshot.error = Some(recorded);
                    snapshot.loading = !settled;
                    snapshot.phase = match (settled, has_data) {
                        (false, _) => QueryPhase::Fetching,
                        (true, true) => QueryPhase::Ready,
                        (true, false) => QueryPhase::Idle,
                    };
                });
                if has_data {
                    self.arm_stale_timer(&mut state);
                }
                Err(err)
            }
        }
    }

    fn arm_stale_timer(self: &Arc<Self>, state: &mut SubscriptionState) {
        state.cancel_timer();
        let Some(stale_time) = self.stale_time else {
            return;
        };
        if state.closed {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        state.timer = Some(self.scheduler.after(
            stale_time,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tracing::debug!(subscription = %inner.id, "Stale timer fired, revalidating");
                spawn_background("stale revalidation", async move {
                    // failures are recorded on the snapshot
                    let _ = inner
                        .run_fetch(FetchPolicy::NetworkOnly, FetchKind::Revalidation)
                        .await;
                });
            }),
        ));
    }
}

/// Handle to one active query.
///
/// Dropping it cancels the pending stale timer; an in-flight fetch still
/// completes and merges into the store.
pub struct QuerySubscription {
    inner: Arc<SubscriptionInner>,
}

impl QuerySubscription {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn request(&self) -> QueryRequest {
        self.inner.current_request()
    }

    /// Run the fetch the subscription was configured with.
    pub async fn fetch(&self) -> BlueprintResult<Value> {
        self.inner
            .run_fetch(self.inner.fetch_policy, FetchKind::Foreground)
            .await
    }

    /// Re-issue the query network-only and reset the stale timer.
    pub async fn refetch(&self) -> BlueprintResult<Value> {
        self.inner
            .run_fetch(FetchPolicy::NetworkOnly, FetchKind::Foreground)
            .await
    }

    /// Switch variables, re-issuing only when they deep-change.
    ///
    /// Returns `Ok(None)` when the variables are equal to the current ones.
    pub async fn set_variables(&self, variables: Value) -> BlueprintResult<Option<Value>> {
        let changed = {
            let mut state = self.inner.lock();
            let before = state.request_memo.computations();
            let query = self.inner.query.clone();
            let vars = variables.clone();
            state
                .request_memo
                .get(std::slice::from_ref(&variables), || QueryRequest::new(query, vars));
            state.request_memo.computations() != before
        };
        if !changed {
            tracing::trace!(subscription = %self.inner.id, "Variables unchanged, skipping fetch");
            return Ok(None);
        }
        self.fetch().await.map(Some)
    }

    /// Apply a local, network-free edit to the cached result.
    ///
    /// Entities touched by the edit change for every query that shares them.
    /// Staleness and the stale timer are left alone.
    pub fn update<F>(&self, mutate: F) -> BlueprintResult<()>
    where
        F: FnOnce(&mut Value),
    {
        let query_key = self.request().cache_key();
        let data = self.inner.client.with_store(|store| {
            store.update_query(&query_key, mutate)?;
            Ok::<_, BlueprintError>(store.read_query(&query_key))
        })?;
        self.inner.snapshot.send_modify(|snapshot| {
            snapshot.data = data;
            snapshot.updated_at = Some(Utc::now());
        });
        Ok(())
    }

    /// Evict the cached result, collecting orphaned entities when the
    /// manager is configured to.
    pub fn clear(&self) {
        self.clear_with_gc(self.inner.gc_on_clear);
    }

    /// Evict the cached result; `gc` also removes entities no other stored
    /// query reaches.
    pub fn clear_with_gc(&self, gc: bool) {
        let query_key = self.request().cache_key();
        {
            let mut state = self.inner.lock();
            state.cancel_timer();
            // completions already in flight must not resurrect the snapshot
            state.applied = state.issued;
        }
        let removed = self.inner.client.with_store(|store| {
            store.evict_query(&query_key);
            if gc {
                store.gc()
            } else {
                0
            }
        });
        tracing::debug!(subscription = %self.inner.id, query = %query_key, removed, "Cleared query cache");
        self.inner.snapshot.send_modify(|snapshot| {
            *snapshot = QuerySnapshot {
                phase: QueryPhase::Evicted,
                ..QuerySnapshot::default()
            };
        });
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn watch(&self) -> watch::Receiver<QuerySnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Current result straight from the store, including changes made by
    /// other queries that share entities with this one.
    pub fn read_cache(&self) -> Option<Value> {
        self.inner.client.read_cached(&self.request())
    }

    pub fn has_pending_timer(&self) -> bool {
        self.inner
            .lock()
            .timer
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.cancel_timer();
        tracing::trace!(subscription = %self.inner.id, "Query subscription dropped");
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("id", &self.inner.id)
            .field("query", &self.inner.query)
            .field("phase", &self.inner.snapshot.borrow().phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueprint_core::{StoreConfig, TokioScheduler, TrackerConfig};
    use blueprint_storage::EntityStore;
    use blueprint_test_utils::{fixtures, MockTransport};
    use serde_json::json;

    fn manager(transport: Arc<MockTransport>) -> QueryCacheManager {
        let client = QueryClient::new(
            transport,
            EntityStore::new(StoreConfig::default()).unwrap(),
            &QueryConfig::default(),
        )
        .unwrap();
        QueryCacheManager::new(
            client,
            Arc::new(AccessTracker::new(TrackerConfig::default()).unwrap()),
            TokioScheduler::shared(),
            QueryConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_records_entities() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("component", fixtures::component_payload("1", &["10", "11"]));
        let manager = manager(transport);

        let sub = manager
            .start(QueryOptions::new(QueryRequest::named("component")))
            .await;
        let snapshot = sub.snapshot();
        assert_eq!(snapshot.phase, QueryPhase::Ready);
        assert!(!snapshot.loading);
        assert!(snapshot.updated_at.is_some());
        assert_eq!(manager.tracker().len(), 3);
        assert!(!sub.has_pending_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_keeps_timer_and_staleness() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("component", fixtures::component_payload("1", &["10"]));
        let manager = manager(transport);

        let sub = manager
            .start(
                QueryOptions::new(QueryRequest::named("component"))
                    .with_stale_time(Duration::from_secs(1)),
            )
            .await;
        assert!(sub.has_pending_timer());

        sub.update(|data| data["component"]["name"] = json!("renamed"))
            .unwrap();
        let snapshot = sub.snapshot();
        assert_eq!(snapshot.data.unwrap()["component"]["name"], "renamed");
        assert!(!snapshot.is_stale);
        assert!(sub.has_pending_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_variables_skips_equal_values() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("component", fixtures::component_payload("1", &[]));
        let manager = manager(transport.clone());

        let sub = manager
            .start(QueryOptions::new(QueryRequest::new(
                "component",
                json!({"id": "1", "depth": 1}),
            )))
            .await;
        let unchanged = sub
            .set_variables(json!({"depth": 1.0, "id": "1"}))
            .await
            .unwrap();
        assert!(unchanged.is_none());
        assert_eq!(transport.call_count("component"), 1);

        let changed = sub.set_variables(json!({"id": "2"})).await.unwrap();
        assert!(changed.is_some());
        assert_eq!(transport.call_count("component"), 2);
        assert_eq!(sub.request().variables, json!({"id": "2"}));
    }
}
