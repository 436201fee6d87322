//! Blueprint Query - Subscriptions and Predictive Prefetch
//!
//! - [`QueryClient`] executes requests under a [`FetchPolicy`] and keeps
//!   results normalized in a shared store.
//! - [`QueryCacheManager`] hands out [`QuerySubscription`]s with
//!   stale-while-revalidate semantics.
//! - [`PredictivePrefetcher`] warms the store from the access log.

pub mod client;
pub mod manager;
pub mod prefetch;

pub use blueprint_core::{FetchPolicy, QueryRequest, Transport};
pub use client::{QueryClient, QueryOutcome};
pub use manager::{QueryCacheManager, QueryOptions, QueryPhase, QuerySnapshot, QuerySubscription};
pub use prefetch::{
    EntityQueryBuilder, HoverPrefetch, PredictivePrefetcher, PrefetchController, PrefetchMetrics,
    PrefetchMetricsSnapshot,
};

use std::future::Future;

/// Spawn fire-and-forget work on the ambient runtime.
///
/// Timer callbacks can run outside any runtime (a manually driven
/// scheduler), in which case the work is dropped with a warning.
pub(crate) fn spawn_background<F>(task: &'static str, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(work);
        }
        Err(_) => {
            tracing::warn!(task, "No tokio runtime available, background work dropped");
        }
    }
}
