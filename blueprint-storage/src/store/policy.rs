//! Per-type read and merge policies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::node::{CacheEntry, Node};

/// How an incoming list combines with the list already stored in a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListMergePolicy {
    /// The incoming list wins outright. Right for live snapshots such as
    /// "current instances of a component".
    #[default]
    Replace,
    /// Keep the stored items and append incoming items not already present.
    /// References compare by entity key, everything else structurally.
    AppendUnique,
}

type ReadFn = dyn Fn(&CacheEntry) -> Value + Send + Sync;

/// A field computed from an entry's stored fields every time it is read.
#[derive(Clone)]
pub struct DerivedField {
    read: Arc<ReadFn>,
}

impl DerivedField {
    pub fn new<F>(read: F) -> Self
    where
        F: Fn(&CacheEntry) -> Value + Send + Sync + 'static,
    {
        Self {
            read: Arc::new(read),
        }
    }

    /// Length of the list stored in `source`; 0 when missing or not a list.
    pub fn count_of(source: impl Into<String>) -> Self {
        let source = source.into();
        Self::new(move |entry| {
            let count = entry
                .field(&source)
                .and_then(Node::as_list)
                .map_or(0, <[Node]>::len);
            Value::from(count)
        })
    }

    pub fn compute(&self, entry: &CacheEntry) -> Value {
        (self.read)(entry)
    }
}

impl fmt::Debug for DerivedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedField(..)")
    }
}

/// Read and merge policies for one typename.
#[derive(Debug, Clone, Default)]
pub struct TypePolicy {
    derived: HashMap<String, DerivedField>,
    merge: HashMap<String, ListMergePolicy>,
}

impl TypePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_derived(mut self, field: impl Into<String>, derived: DerivedField) -> Self {
        self.derived.insert(field.into(), derived);
        self
    }

    pub fn with_merge(mut self, field: impl Into<String>, policy: ListMergePolicy) -> Self {
        self.merge.insert(field.into(), policy);
        self
    }

    pub fn derived(&self, field: &str) -> Option<&DerivedField> {
        self.derived.get(field)
    }

    pub fn is_derived(&self, field: &str) -> bool {
        self.derived.contains_key(field)
    }

    pub fn derived_fields(&self) -> impl Iterator<Item = (&String, &DerivedField)> {
        self.derived.iter()
    }

    pub fn merge_policy(&self, field: &str) -> ListMergePolicy {
        self.merge.get(field).copied().unwrap_or_default()
    }
}
