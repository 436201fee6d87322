//! Predictive prefetching.
//!
//! The prefetcher periodically ranks the access log and warms the store with
//! the most frequently seen entities. Everything it does is advisory: a
//! failed prefetch is counted and logged, never returned.

use blueprint_core::{
    BlueprintError, ConfigError, FetchPolicy, PrefetchConfig, QueryRequest, Scheduler,
    TimerHandle,
};
use blueprint_memo::Debouncer;
use blueprint_storage::AccessTracker;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::client::QueryClient;
use crate::spawn_background;

/// Builds the query that loads one entity of a given type.
pub trait EntityQueryBuilder: Send + Sync {
    fn build(&self, id: &str) -> QueryRequest;
}

impl<F> EntityQueryBuilder for F
where
    F: Fn(&str) -> QueryRequest + Send + Sync,
{
    fn build(&self, id: &str) -> QueryRequest {
        self(id)
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for prefetch activity.
#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    /// Cycles started since the prefetcher was created
    pub cycles: AtomicU64,

    /// Entity and hover prefetches that completed
    pub fetched: AtomicU64,

    /// Prefetches whose fetch failed
    pub failed: AtomicU64,

    /// Candidates dropped for an unsupported type or missing query builder
    pub skipped: AtomicU64,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PrefetchMetricsSnapshot {
        PrefetchMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Prefetch counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefetchMetricsSnapshot {
    pub cycles: u64,
    pub fetched: u64,
    pub failed: u64,
    pub skipped: u64,
}

// ============================================================================
// PREFETCHER
// ============================================================================

/// Warms the store with the entities the access log ranks highest.
pub struct PredictivePrefetcher {
    client: QueryClient,
    tracker: Arc<AccessTracker>,
    scheduler: Arc<dyn Scheduler>,
    config: PrefetchConfig,
    builders: HashMap<String, Arc<dyn EntityQueryBuilder>>,
    metrics: Arc<PrefetchMetrics>,
}

impl PredictivePrefetcher {
    pub fn new(
        client: QueryClient,
        tracker: Arc<AccessTracker>,
        scheduler: Arc<dyn Scheduler>,
        config: PrefetchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            tracker,
            scheduler,
            config,
            builders: HashMap::new(),
            metrics: Arc::new(PrefetchMetrics::new()),
        })
    }

    /// Register how to load entities of `entity_type`.
    pub fn register<B>(&mut self, entity_type: impl Into<String>, builder: B)
    where
        B: EntityQueryBuilder + 'static,
    {
        self.builders.insert(entity_type.into(), Arc::new(builder));
    }

    pub fn with_builder<B>(mut self, entity_type: impl Into<String>, builder: B) -> Self
    where
        B: EntityQueryBuilder + 'static,
    {
        self.register(entity_type, builder);
        self
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PrefetchMetrics> {
        &self.metrics
    }

    /// Run a cycle now, then one every `interval` until the returned
    /// controller is stopped or dropped.
    pub fn start(self: &Arc<Self>) -> PrefetchController {
        let (shutdown, _) = watch::channel(false);
        let control = Arc::new(ControlState {
            shutdown,
            timer: Mutex::new(None),
        });

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            limit = self.config.limit,
            supported_types = ?self.config.supported_types,
            "Predictive prefetcher started"
        );
        Arc::clone(self).spawn_cycle(Arc::clone(&control));
        PrefetchController { control }
    }

    /// One ranking pass: take the top candidates, keep the supported types
    /// and fetch each network-only, one after another.
    ///
    /// Returns how many entities were fetched.
    pub async fn run_cycle(&self) -> usize {
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);

        let (supported, unsupported): (Vec<_>, Vec<_>) = self
            .tracker
            .top_n(self.config.limit)
            .into_iter()
            .partition(|candidate| self.config.supports(&candidate.entity_type));

        if !unsupported.is_empty() {
            self.metrics
                .skipped
                .fetch_add(unsupported.len() as u64, Ordering::Relaxed);
        }
        if supported.is_empty() {
            tracing::trace!("Prefetch cycle found no candidates");
            return 0;
        }

        let mut fetched = 0;
        for candidate in &supported {
            if self.prefetch_entity(&candidate.entity_type, &candidate.id).await {
                fetched += 1;
            }
        }
        tracing::debug!(
            candidates = supported.len(),
            fetched,
            skipped = unsupported.len(),
            "Prefetch cycle completed"
        );
        fetched
    }

    /// Best-effort fetch of one entity outside the periodic cycle.
    pub async fn prefetch_one(&self, entity_type: &str, id: &str) {
        self.prefetch_entity(entity_type, id).await;
    }

    /// Build a hover handler: each hovered item is turned into variables for
    /// `query` and fetched cache-first. With a non-zero
    /// [`hover_delay`](PrefetchConfig::hover_delay), only the last item of a
    /// burst is fetched.
    pub fn prefetch_on_hover<I, F>(
        &self,
        query: impl Into<String>,
        variables_from_item: F,
    ) -> HoverPrefetch<I>
    where
        I: ?Sized,
        F: Fn(&I) -> Value + Send + Sync + 'static,
    {
        let target = Arc::new(HoverTarget {
            client: self.client.clone(),
            metrics: Arc::clone(&self.metrics),
        });
        let dispatch = if self.config.hover_delay.is_zero() {
            HoverDispatch::Immediate(target)
        } else {
            HoverDispatch::Debounced(Debouncer::new(
                Arc::clone(&self.scheduler),
                self.config.hover_delay,
                move |request: QueryRequest| target.fire(request),
            ))
        };
        HoverPrefetch {
            query: query.into(),
            variables_from_item: Box::new(variables_from_item),
            dispatch,
        }
    }

    async fn prefetch_entity(&self, entity_type: &str, id: &str) -> bool {
        let target = format!("{entity_type}:{id}");
        let Some(builder) = self.builders.get(entity_type) else {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = %target, "No query builder registered, skipping prefetch");
            return false;
        };

        let request = builder.build(id);
        match self.client.execute(&request, FetchPolicy::NetworkOnly).await {
            Ok(_) => {
                self.metrics.fetched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(entity = %target, "Prefetched entity");
                true
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                let err = BlueprintError::prefetch(target, err);
                tracing::warn!(error = %err, "Prefetch failed");
                false
            }
        }
    }

    fn spawn_cycle(self: Arc<Self>, control: Arc<ControlState>) {
        spawn_background("prefetch cycle", async move {
            let shutdown = control.shutdown.subscribe();
            tokio::select! {
                biased;
                _ = wait_for_stop(shutdown) => {
                    tracing::debug!("Prefetch cycle abandoned");
                    return;
                }
                _ = self.run_cycle() => {}
            }
            self.schedule_next(&control);
        });
    }

    fn schedule_next(self: &Arc<Self>, control: &Arc<ControlState>) {
        let mut timer = control.lock_timer();
        if control.is_stopped() {
            return;
        }
        let this = Arc::clone(self);
        let next = Arc::clone(control);
        *timer = Some(self.scheduler.after(
            self.config.interval,
            Box::new(move || this.spawn_cycle(next)),
        ));
    }
}

impl fmt::Debug for PredictivePrefetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.builders.keys().collect();
        types.sort();
        f.debug_struct("PredictivePrefetcher")
            .field("config", &self.config)
            .field("builders", &types)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

async fn wait_for_stop(mut shutdown: watch::Receiver<bool>) {
    loop {
        let stopped = *shutdown.borrow_and_update();
        if stopped {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

struct ControlState {
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<TimerHandle>>,
}

impl ControlState {
    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running prefetch loop. Dropping it stops the loop.
pub struct PrefetchController {
    control: Arc<ControlState>,
}

impl PrefetchController {
    /// Cancel the next scheduled cycle and abandon the rest of an in-flight
    /// one. Idempotent.
    pub fn stop(&self) {
        let was_stopped = self.control.shutdown.send_replace(true);
        if let Some(timer) = self.control.lock_timer().take() {
            timer.cancel();
        }
        if !was_stopped {
            tracing::info!("Predictive prefetcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_stopped()
    }
}

impl Drop for PrefetchController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PrefetchController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchController")
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// HOVER
// ============================================================================

struct HoverTarget {
    client: QueryClient,
    metrics: Arc<PrefetchMetrics>,
}

impl HoverTarget {
    fn fire(self: &Arc<Self>, request: QueryRequest) {
        let target = Arc::clone(self);
        spawn_background("hover prefetch", async move {
            match target.client.execute(&request, FetchPolicy::CacheFirst).await {
                Ok(outcome) => {
                    if !outcome.from_cache {
                        target.metrics.fetched.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err) => {
                    target.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    let err = BlueprintError::prefetch(request.cache_key(), err);
                    tracing::debug!(error = %err, "Hover prefetch failed");
                }
            }
        });
    }
}

enum HoverDispatch {
    Immediate(Arc<HoverTarget>),
    Debounced(Debouncer<QueryRequest>),
}

/// Hover handler returned by [`PredictivePrefetcher::prefetch_on_hover`].
pub struct HoverPrefetch<I: ?Sized> {
    query: String,
    variables_from_item: Box<dyn Fn(&I) -> Value + Send + Sync>,
    dispatch: HoverDispatch,
}

impl<I: ?Sized> HoverPrefetch<I> {
    /// Warm the cache for `item`. Never fails; the fetch runs in the
    /// background.
    pub fn on_hover(&self, item: &I) {
        let variables = (self.variables_from_item)(item);
        let request = QueryRequest::new(self.query.clone(), variables);
        match &self.dispatch {
            HoverDispatch::Immediate(target) => target.fire(request),
            HoverDispatch::Debounced(debouncer) => debouncer.call(request),
        }
    }

    /// Whether a debounced hover is waiting for its quiet period.
    pub fn is_pending(&self) -> bool {
        match &self.dispatch {
            HoverDispatch::Immediate(_) => false,
            HoverDispatch::Debounced(debouncer) => debouncer.is_pending(),
        }
    }

    /// Drop a debounced hover that has not fired yet.
    pub fn cancel(&self) {
        if let HoverDispatch::Debounced(debouncer) = &self.dispatch {
            debouncer.cancel();
        }
    }
}

impl<I: ?Sized> fmt::Debug for HoverPrefetch<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HoverPrefetch")
            .field("query", &self.query)
            .field("pending", &self.is_pending())
            .finish()
    }
}
