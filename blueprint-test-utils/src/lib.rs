//! Blueprint Test Utilities
//!
//! Shared test infrastructure for the Blueprint workspace:
//! - A scripted mock transport
//! - Proptest generators for keys, payloads and access logs
//! - Response fixtures for the architecture-catalogue domain
//! - Custom assertions over the store and prefetch rankings

pub use blueprint_core::{
    BlueprintError, BlueprintResult, EntityKey, FetchError, PrefetchCandidate, QueryRequest,
    StoreConfig, Transport,
};
pub use blueprint_storage::{EntityStore, Node};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

#[derive(Clone)]
struct ScriptedResponse {
    gate: Option<Arc<Notify>>,
    result: Result<Value, FetchError>,
}

/// Transport that answers from a per-query script.
///
/// Responses queued for a query name are consumed in order; the last one
/// repeats for every later call. A gated response waits for its [`Notify`]
/// before answering, which lets tests hold a fetch in flight. Queries with
/// no script fail with [`FetchError::Transport`].
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<QueryRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, query: &str, data: Value) -> &Self {
        self.push(query, None, Ok(data))
    }

    pub fn fail(&self, query: &str, reason: &str) -> &Self {
        let err = FetchError::Transport {
            query: query.to_string(),
            reason: reason.to_string(),
        };
        self.push(query, None, Err(err))
    }

    pub fn respond_gated(&self, query: &str, gate: Arc<Notify>, data: Value) -> &Self {
        self.push(query, Some(gate), Ok(data))
    }

    pub fn fail_gated(&self, query: &str, gate: Arc<Notify>, reason: &str) -> &Self {
        let err = FetchError::Transport {
            query: query.to_string(),
            reason: reason.to_string(),
        };
        self.push(query, Some(gate), Err(err))
    }

    /// Every request received, in arrival order.
    pub fn calls(&self) -> Vec<QueryRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, query: &str) -> usize {
        lock(&self.calls).iter().filter(|r| r.query == query).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    fn push(&self, query: &str, gate: Option<Arc<Notify>>, result: Result<Value, FetchError>) -> &Self {
        lock(&self.script)
            .entry(query.to_string())
            .or_default()
            .push_back(ScriptedResponse { gate, result });
        self
    }

    fn next_response(&self, query: &str) -> Option<ScriptedResponse> {
        let mut script = lock(&self.script);
        let queue = script.get_mut(query)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &QueryRequest) -> BlueprintResult<Value> {
        lock(&self.calls).push(request.clone());
        let Some(response) = self.next_response(&request.query) else {
            return Err(FetchError::Transport {
                query: request.query.clone(),
                reason: "no scripted response".to_string(),
            }
            .into());
        };
        if let Some(gate) = &response.gate {
            gate.notified().await;
        }
        response.result.map_err(Into::into)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // a second call finds the global subscriber already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Blueprint values.

    use super::*;
    use proptest::prelude::*;

    /// Typenames from the architecture catalogue.
    pub fn arb_typename() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("Component".to_string()),
            Just("Instance".to_string()),
            Just("Team".to_string()),
            Just("ADR".to_string()),
            Just("Environment".to_string()),
        ]
    }

    /// Ids as they appear in keys: short alphanumerics or numbers.
    pub fn arb_id() -> impl Strategy<Value = String> {
        prop_oneof!["[a-z0-9]{1,8}", any::<u32>().prop_map(|n| n.to_string())]
    }

    pub fn arb_entity_key() -> impl Strategy<Value = EntityKey> {
        (arb_typename(), arb_id()).prop_map(|(t, id)| EntityKey::new(t, id))
    }

    /// An access log drawn from a small key space so counts collide.
    pub fn arb_access_log() -> impl Strategy<Value = Vec<EntityKey>> {
        let key = (arb_typename(), 0u8..5).prop_map(|(t, id)| EntityKey::new(t, id.to_string()));
        prop::collection::vec(key, 0..50)
    }

    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-zA-Z ]{0,12}".prop_map(Value::String),
        ]
    }

    /// Arbitrary JSON without entity identity fields.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// A flat entity object with arbitrary scalar fields.
    pub fn arb_entity() -> impl Strategy<Value = Value> {
        (
            arb_entity_key(),
            prop::collection::btree_map("[a-z]{1,6}", arb_scalar(), 0..5),
        )
            .prop_map(|(key, fields)| {
                let mut object: serde_json::Map<String, Value> = fields.into_iter().collect();
                object.insert("__typename".to_string(), json!(key.typename));
                object.insert("id".to_string(), json!(key.id));
                Value::Object(object)
            })
    }

    pub fn arb_query_request() -> impl Strategy<Value = QueryRequest> {
        ("[a-z]{3,10}", prop::option::of(arb_json()))
            .prop_map(|(query, vars)| QueryRequest::new(query, vars.unwrap_or(Value::Null)))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Response payloads shaped like the catalogue's queries.

    use super::*;
    use blueprint_storage::{DerivedField, ListMergePolicy, TypePolicy};

    /// `{ component: { Component, instances: [Instance...] } }`
    pub fn component_payload(id: &str, instance_ids: &[&str]) -> Value {
        let instances: Vec<Value> = instance_ids
            .iter()
            .map(|instance| {
                json!({
                    "__typename": "Instance",
                    "id": instance,
                    "status": "UP",
                })
            })
            .collect();
        json!({
            "component": {
                "__typename": "Component",
                "id": id,
                "name": format!("component-{id}"),
                "instances": instances,
            }
        })
    }

    pub fn team_payload(id: &str) -> Value {
        json!({
            "team": {
                "__typename": "Team",
                "id": id,
                "name": format!("team-{id}"),
            }
        })
    }

    /// Catalogue listing: several components owned by one team.
    pub fn catalogue_payload(team_id: &str, component_ids: &[&str]) -> Value {
        let components: Vec<Value> = component_ids
            .iter()
            .map(|id| {
                json!({
                    "__typename": "Component",
                    "id": id,
                    "owner": {"__typename": "Team", "id": team_id},
                })
            })
            .collect();
        json!({ "components": components })
    }

    /// Store with the catalogue's type policies: `Component.totalInstances`
    /// counts `instances`, and `Component.tags` accumulates.
    pub fn catalogue_store() -> EntityStore {
        EntityStore::default().with_policy(
            "Component",
            TypePolicy::new()
                .with_derived("totalInstances", DerivedField::count_of("instances"))
                .with_merge("tags", ListMergePolicy::AppendUnique),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions with messages that name the entity involved.

    use super::*;

    /// Assert a stored scalar field.
    pub fn assert_entity_field(store: &EntityStore, key: &str, field: &str, expected: Value) {
        let entity: EntityKey = key
            .parse()
            .unwrap_or_else(|e| panic!("invalid entity key {key}: {e}"));
        let entry = store
            .entry(&entity)
            .unwrap_or_else(|| panic!("entity {key} is not in the store"));
        match entry.field(field) {
            Some(Node::Scalar(actual)) => assert_eq!(
                actual, &expected,
                "field {field} of {key} has unexpected value"
            ),
            other => panic!("field {field} of {key} is not a scalar: {other:?}"),
        }
    }

    pub fn assert_entity_missing(store: &EntityStore, key: &str) {
        let entity: EntityKey = key
            .parse()
            .unwrap_or_else(|e| panic!("invalid entity key {key}: {e}"));
        assert!(store.entry(&entity).is_none(), "expected {key} to be absent");
    }

    /// Assert the exact ranking, as `"Type:id"` strings.
    pub fn assert_ranking(candidates: &[PrefetchCandidate], expected: &[&str]) {
        let actual: Vec<String> = candidates.iter().map(|c| c.key().to_string()).collect();
        assert_eq!(actual, expected, "unexpected prefetch ranking");
    }

    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &BlueprintResult<T>) {
        match result {
            Err(err) => assert!(
                matches!(err.root_cause(), BlueprintError::Fetch(_)),
                "expected fetch error, got {err:?}"
            ),
            Ok(value) => panic!("expected fetch error, got Ok({value:?})"),
        }
    }
}
