//! Fetch-policy execution over the normalized store.

use blueprint_core::{
    BlueprintResult, ConfigError, EntityKey, FetchError, FetchPolicy, QueryConfig, QueryRequest,
    Transport,
};
use blueprint_storage::EntityStore;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of one executed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Denormalized result, read back from the store.
    pub data: Value,
    /// Entities observed in the result, in encounter order.
    pub entities: Vec<EntityKey>,
    pub from_cache: bool,
}

/// Runs queries through a [`Transport`] and keeps their results normalized
/// in a shared [`EntityStore`].
///
/// Cloning is cheap; clones share the store and transport. The store lock is
/// only taken for synchronous reads and merges, never across a fetch.
#[derive(Clone)]
pub struct QueryClient {
    transport: Arc<dyn Transport>,
    store: Arc<Mutex<EntityStore>>,
    fetch_timeout: Option<Duration>,
}

impl QueryClient {
    /// Wrap `store` for sharing. A zero fetch timeout is rejected.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: EntityStore,
        config: &QueryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            store: Arc::new(Mutex::new(store)),
            fetch_timeout: config.fetch_timeout,
        })
    }

    /// Execute `request` under `policy`.
    ///
    /// - `CacheFirst` answers from the store when the root result exists.
    /// - `NetworkOnly` and `CacheAndNetwork` always hit the transport. For
    ///   the latter, callers that want the cached value up front read it with
    ///   [`read_cached`](Self::read_cached) before awaiting this call.
    pub async fn execute(
        &self,
        request: &QueryRequest,
        policy: FetchPolicy,
    ) -> BlueprintResult<QueryOutcome> {
        let query_key = request.cache_key();

        if policy == FetchPolicy::CacheFirst {
            if let Some(outcome) = self.cached_outcome(&query_key) {
                tracing::debug!(query = %query_key, "Served query from cache");
                return Ok(outcome);
            }
        }

        tracing::debug!(query = %query_key, policy = %policy, "Fetching query");
        let response = self.fetch(request).await?;
        if response.is_null() {
            return Err(FetchError::InvalidResponse {
                query: request.query.clone(),
                reason: "response carried no data".to_string(),
            }
            .into());
        }

        let mut store = self.lock();
        let entities = store.write_query(&query_key, &response);
        let data = store.read_query(&query_key).unwrap_or(response);
        Ok(QueryOutcome {
            data,
            entities,
            from_cache: false,
        })
    }

    /// Current denormalized result for `request`, if cached.
    pub fn read_cached(&self, request: &QueryRequest) -> Option<Value> {
        self.lock().read_query(&request.cache_key())
    }

    /// Run `f` with exclusive access to the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut EntityStore) -> R) -> R {
        f(&mut self.lock())
    }

    async fn fetch(&self, request: &QueryRequest) -> BlueprintResult<Value> {
        let send = self.transport.send(request);
        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.map_err(|_| {
                FetchError::Timeout {
                    query: request.query.clone(),
                    timeout: limit,
                }
            })?,
            None => send.await,
        }
    }

    fn cached_outcome(&self, query_key: &str) -> Option<QueryOutcome> {
        let store = self.lock();
        let data = store.read_query(query_key)?;
        let entities = store.query_entities(query_key).unwrap_or_default();
        Some(QueryOutcome {
            data,
            entities,
            from_cache: true,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EntityStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("entities", &self.lock().len())
            .finish()
    }
}
