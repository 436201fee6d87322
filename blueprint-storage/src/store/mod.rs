//! Normalized entity store.
//!
//! Query responses are trees. Any object carrying both a type discriminator
//! and an id is an entity: it is pulled out into a single [`CacheEntry`] and
//! replaced in the tree by a [`Node::Reference`]. Every query that mentions
//! the same entity therefore reads the same merged record.

mod node;
mod policy;

pub use node::{CacheEntry, Node};
pub use policy::{DerivedField, ListMergePolicy, TypePolicy};

use blueprint_core::{ConfigError, EntityKey, StoreConfig, StoreError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// How a reference to an entity that is not stored resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Missing {
    Null,
    /// Bare `{typename, id}`, so a local edit can write the link back.
    Identity,
}

/// Normalized cache of entities plus the root trees of the queries that
/// produced them.
#[derive(Debug, Default)]
pub struct EntityStore {
    config: StoreConfig,
    entries: HashMap<EntityKey, CacheEntry>,
    roots: HashMap<String, Node>,
    policies: HashMap<String, TypePolicy>,
}

impl EntityStore {
    /// Create an empty store. Rejects identity field names that are empty
    /// or equal.
    pub fn new(config: StoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Install (or replace) the read/merge policy for a typename.
    pub fn register_policy(&mut self, typename: impl Into<String>, policy: TypePolicy) {
        self.policies.insert(typename.into(), policy);
    }

    pub fn with_policy(mut self, typename: impl Into<String>, policy: TypePolicy) -> Self {
        self.register_policy(typename, policy);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ========================================================================
    // NORMALIZATION
    // ========================================================================

    /// Normalize a response tree, merging every entity it contains.
    pub fn normalize(&mut self, response: &Value) -> Node {
        let mut seen = Vec::new();
        self.normalize_value(response, &mut seen)
    }

    fn normalize_value(&mut self, value: &Value, seen: &mut Vec<EntityKey>) -> Node {
        match value {
            Value::Array(items) => Node::List(
                items
                    .iter()
                    .map(|item| self.normalize_value(item, seen))
                    .collect(),
            ),
            Value::Object(map) => match self.identify(map) {
                Some(key) => {
                    seen.push(key.clone());
                    let fields = self.normalize_fields(map, seen);
                    self.merge_entry(&key, fields);
                    Node::Reference(key)
                }
                None => Node::Object(self.normalize_fields(map, seen)),
            },
            scalar => Node::Scalar(scalar.clone()),
        }
    }

    fn normalize_fields(
        &mut self,
        map: &Map<String, Value>,
        seen: &mut Vec<EntityKey>,
    ) -> BTreeMap<String, Node> {
        map.iter()
            .map(|(name, value)| (name.clone(), self.normalize_value(value, seen)))
            .collect()
    }

    fn identify(&self, map: &Map<String, Value>) -> Option<EntityKey> {
        let typename = map.get(&self.config.typename_field)?;
        let id = map.get(&self.config.id_field)?;
        EntityKey::from_json(typename, id)
    }

    fn merge_entry(&mut self, key: &EntityKey, incoming: BTreeMap<String, Node>) {
        let policy = self.policies.get(&key.typename);
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key));

        for (name, node) in incoming {
            let Some(policy) = policy else {
                entry.fields.insert(name, node);
                continue;
            };
            if policy.is_derived(&name) {
                tracing::trace!(entity = %key, field = %name, "Skipping stored value for derived field");
                continue;
            }
            if policy.merge_policy(&name) == ListMergePolicy::AppendUnique {
                if let (Some(Node::List(existing)), Node::List(items)) =
                    (entry.fields.get_mut(&name), &node)
                {
                    for item in items {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                    continue;
                }
            }
            entry.fields.insert(name, node);
        }
    }

    // ========================================================================
    // ENTITY ACCESS
    // ========================================================================

    /// Evaluate a derived field against the entry's current fields.
    ///
    /// `key` is the encoded `"Type:id"` form.
    pub fn read_derived(&self, key: &str, field: &str) -> Result<Value, StoreError> {
        let key: EntityKey = key.parse()?;
        let entry = self
            .entries
            .get(&key)
            .ok_or_else(|| StoreError::EntityNotFound {
                key: key.to_string(),
            })?;
        let derived = self
            .policies
            .get(&key.typename)
            .and_then(|policy| policy.derived(field))
            .ok_or_else(|| StoreError::NoReadPolicy {
                typename: key.typename.clone(),
                field: field.to_string(),
            })?;
        Ok(derived.compute(entry))
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove one entity. References to it elsewhere are left dangling and
    /// resolve to `null`.
    pub fn evict(&mut self, key: &EntityKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            tracing::debug!(entity = %key, "Evicted entity");
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entity and query root. Policies are kept.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.roots.clear();
    }

    // ========================================================================
    // QUERY ROOTS
    // ========================================================================

    /// Normalize `response` and store it as the root of `query_key`.
    ///
    /// Returns every entity key observed, in encounter order, repeats
    /// included.
    pub fn write_query(&mut self, query_key: &str, response: &Value) -> Vec<EntityKey> {
        let mut seen = Vec::new();
        let root = self.normalize_value(response, &mut seen);
        self.roots.insert(query_key.to_string(), root);
        tracing::trace!(query = %query_key, entities = seen.len(), "Wrote query result");
        seen
    }

    /// Denormalize the stored root of `query_key`.
    pub fn read_query(&self, query_key: &str) -> Option<Value> {
        self.roots.get(query_key).map(|root| self.resolve(root))
    }

    /// Entities the stored result of `query_key` reaches, depth first.
    ///
    /// Mirrors what [`write_query`](Self::write_query) reports for the same
    /// result, so a cache hit can be recorded like a fetch.
    pub fn query_entities(&self, query_key: &str) -> Option<Vec<EntityKey>> {
        let root = self.roots.get(query_key)?;
        let mut out = Vec::new();
        let mut path = HashSet::new();
        self.walk_entities(root, &mut path, &mut out);
        Some(out)
    }

    fn walk_entities(&self, node: &Node, path: &mut HashSet<EntityKey>, out: &mut Vec<EntityKey>) {
        match node {
            Node::Scalar(_) => {}
            Node::List(items) => items.iter().for_each(|n| self.walk_entities(n, path, out)),
            Node::Object(fields) => fields
                .values()
                .for_each(|n| self.walk_entities(n, path, out)),
            Node::Reference(key) => {
                let Some(entry) = self.entries.get(key) else {
                    return;
                };
                out.push(key.clone());
                if path.insert(key.clone()) {
                    entry
                        .fields
                        .values()
                        .for_each(|n| self.walk_entities(n, path, out));
                    path.remove(key);
                }
            }
        }
    }

    pub fn has_query(&self, query_key: &str) -> bool {
        self.roots.contains_key(query_key)
    }

    pub fn query_keys(&self) -> impl Iterator<Item = &String> {
        self.roots.keys()
    }

    /// Apply a local mutation to the denormalized result of `query_key` and
    /// write it back, so entities it touches update for every other query
    /// as well.
    ///
    /// Unlike a fetch, the edit replaces: an entity whose fields changed
    /// gets exactly the fields the edited object carries, so removed fields
    /// and removed list items stay removed whatever the list merge policy.
    /// Entities the mutation sees as a bare `{typename, id}` object (cycle
    /// stubs, and references to evicted entities) are kept as references
    /// and never written.
    pub fn update_query<F>(
        &mut self,
        query_key: &str,
        mutate: F,
    ) -> Result<Vec<EntityKey>, StoreError>
    where
        F: FnOnce(&mut Value),
    {
        let root = self
            .roots
            .get(query_key)
            .ok_or_else(|| StoreError::QueryNotFound {
                query_key: query_key.to_string(),
            })?;
        let mut value = self.resolve_with(root, Missing::Identity);
        mutate(&mut value);

        let mut seen = Vec::new();
        let mut replaced = HashMap::new();
        let root = self.apply_edit(&value, &mut seen, &mut replaced);
        self.roots.insert(query_key.to_string(), root);
        tracing::debug!(
            query = %query_key,
            replaced = replaced.len(),
            "Applied local edit to query result"
        );
        Ok(seen)
    }

    fn apply_edit(
        &mut self,
        value: &Value,
        seen: &mut Vec<EntityKey>,
        replaced: &mut HashMap<EntityKey, BTreeMap<String, Node>>,
    ) -> Node {
        match value {
            Value::Array(items) => Node::List(
                items
                    .iter()
                    .map(|item| self.apply_edit(item, seen, replaced))
                    .collect(),
            ),
            Value::Object(map) => {
                let Some(key) = self.identify(map) else {
                    return Node::Object(
                        map.iter()
                            .map(|(name, v)| (name.clone(), self.apply_edit(v, seen, replaced)))
                            .collect(),
                    );
                };
                seen.push(key.clone());
                if map.len() == 2 {
                    return Node::Reference(key);
                }

                let mut fields: BTreeMap<String, Node> = map
                    .iter()
                    .map(|(name, v)| (name.clone(), self.apply_edit(v, seen, replaced)))
                    .collect();
                if let Some(policy) = self.policies.get(&key.typename) {
                    fields.retain(|name, _| !policy.is_derived(name));
                }

                // compare against the fields held before this edit, so an
                // untouched second copy cannot undo an edited first one
                let unchanged = match replaced.get(&key) {
                    Some(original) => original == &fields,
                    None => self.entries.get(&key).is_some_and(|e| e.fields == fields),
                };
                if !unchanged {
                    let entry = self
                        .entries
                        .entry(key.clone())
                        .or_insert_with(|| CacheEntry::new(&key));
                    let previous = std::mem::replace(&mut entry.fields, fields);
                    replaced.entry(key.clone()).or_insert(previous);
                }
                Node::Reference(key)
            }
            scalar => Node::Scalar(scalar.clone()),
        }
    }

    /// Forget the root of `query_key`. Entities stay until [`gc`](Self::gc).
    pub fn evict_query(&mut self, query_key: &str) -> bool {
        self.roots.remove(query_key).is_some()
    }

    /// Remove every entity not reachable from a stored query root.
    pub fn gc(&mut self) -> usize {
        let mut reachable: HashSet<EntityKey> = HashSet::new();
        let mut pending: Vec<EntityKey> = self
            .roots
            .values()
            .flat_map(|root| root.references().into_iter().cloned())
            .collect();

        while let Some(key) = pending.pop() {
            if !reachable.insert(key.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&key) {
                for node in entry.fields.values() {
                    pending.extend(node.references().into_iter().cloned());
                }
            }
        }

        let before = self.entries.len();
        self.entries.retain(|key, _| reachable.contains(key));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Garbage collected entities");
        }
        removed
    }

    // ========================================================================
    // DENORMALIZATION
    // ========================================================================

    /// Turn a normalized tree back into JSON.
    ///
    /// References are followed into their entries; missing entries become
    /// `null`. An entity already being expanded higher up the same path is
    /// emitted as its bare identity to break reference cycles.
    pub fn resolve(&self, node: &Node) -> Value {
        self.resolve_with(node, Missing::Null)
    }

    fn resolve_with(&self, node: &Node, missing: Missing) -> Value {
        let mut path = HashSet::new();
        self.resolve_node(node, &mut path, missing)
    }

    fn resolve_node(&self, node: &Node, path: &mut HashSet<EntityKey>, missing: Missing) -> Value {
        match node {
            Node::Scalar(value) => value.clone(),
            Node::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_node(item, path, missing))
                    .collect(),
            ),
            Node::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, node)| (name.clone(), self.resolve_node(node, path, missing)))
                    .collect(),
            ),
            Node::Reference(key) => {
                let Some(entry) = self.entries.get(key) else {
                    return match missing {
                        Missing::Null => Value::Null,
                        Missing::Identity => self.identity_stub(key),
                    };
                };
                if !path.insert(key.clone()) {
                    return self.identity_stub(key);
                }
                let resolved = self.resolve_entry(entry, path, missing);
                path.remove(key);
                resolved
            }
        }
    }

    fn resolve_entry(
        &self,
        entry: &CacheEntry,
        path: &mut HashSet<EntityKey>,
        missing: Missing,
    ) -> Value {
        let mut object: Map<String, Value> = entry
            .fields
            .iter()
            .map(|(name, node)| (name.clone(), self.resolve_node(node, path, missing)))
            .collect();
        if let Some(policy) = self.policies.get(&entry.typename) {
            for (name, derived) in policy.derived_fields() {
                object.insert(name.clone(), derived.compute(entry));
            }
        }
        Value::Object(object)
    }

    fn identity_stub(&self, key: &EntityKey) -> Value {
        let mut object = Map::new();
        object.insert(
            self.config.typename_field.clone(),
            Value::String(key.typename.clone()),
        );
        object.insert(self.config.id_field.clone(), Value::String(key.id.clone()));
        Value::Object(object)
    }
}
