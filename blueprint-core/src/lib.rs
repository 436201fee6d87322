//! Blueprint Core - Shared Types
//!
//! Identity types, fetch policies, errors, configuration, the scheduler
//! abstraction and the transport seam. Every other Blueprint crate depends
//! on this one; it holds no cache state of its own.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod transport;

pub use config::{
    BlueprintConfig, PrefetchConfig, QueryConfig, StoreConfig, TrackerConfig,
    DEFAULT_ID_FIELD, DEFAULT_TYPENAME_FIELD,
};
pub use error::{
    BlueprintError, BlueprintResult, ConfigError, FetchError, MemoError, StoreError,
};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, TimerHandle, TokioScheduler};
pub use transport::Transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY IDENTITY
// ============================================================================

/// Identity of a cached entity: `"{typename}:{id}"`.
///
/// Ids arrive as either JSON strings or numbers. Numbers are kept in their
/// JSON textual form so `1` and `"1"` address the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub typename: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }

    /// Build a key from a raw typename/id pair as found in a payload.
    ///
    /// Returns `None` when the typename is not a string or the id is not a
    /// string or number.
    pub fn from_json(typename: &Value, id: &Value) -> Option<Self> {
        let typename = typename.as_str()?;
        let id = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self::new(typename, id))
    }

    /// Encode as the `"Type:id"` string.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Split a `"Type:id"` string at the first colon.
    pub fn decode(encoded: &str) -> Option<Self> {
        let (typename, id) = encoded.split_once(':')?;
        if typename.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(typename, id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s).ok_or_else(|| StoreError::InvalidKey {
            key: s.to_string(),
        })
    }
}

// ============================================================================
// ACCESS RECORDS
// ============================================================================

/// One observation of an entity in a query result.
///
/// `sequence` is assigned by the tracker and increases with every append, so
/// it doubles as the access order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub entity_type: String,
    pub id: String,
    pub sequence: u64,
}

impl AccessRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.id.clone())
    }
}

/// A ranked entity worth warming, scored by its access count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchCandidate {
    pub entity_type: String,
    pub id: String,
    pub score: u64,
}

impl PrefetchCandidate {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.id.clone())
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// How a query consults the cache before going to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve from cache when present, otherwise fetch.
    #[default]
    CacheFirst,
    /// Always fetch, then write the result to the cache.
    NetworkOnly,
    /// Expose cached data first, then fetch and update.
    CacheAndNetwork,
}

impl FetchPolicy {
    pub fn reads_cache(&self) -> bool {
        !matches!(self, Self::NetworkOnly)
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkOnly => "network-only",
            Self::CacheAndNetwork => "cache-and-network",
        };
        f.write_str(s)
    }
}

/// An opaque query identifier plus its variables.
///
/// The core never parses `query`; it only uses it (with the canonical form
/// of `variables`) as the identity of a cached root result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Value,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self {
            query: query.into(),
            variables,
        }
    }

    /// A request without variables.
    pub fn named(query: impl Into<String>) -> Self {
        Self::new(query, Value::Null)
    }

    /// Cache identity of this request's root result.
    pub fn cache_key(&self) -> String {
        if self.variables.is_null() {
            return self.query.clone();
        }
        format!("{}({})", self.query, canonical_json(&self.variables))
    }
}

/// Serialize JSON with object keys sorted at every level.
///
/// Independent of serde_json's map ordering feature so that cache keys are
/// stable across builds.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
