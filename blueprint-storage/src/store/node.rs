//! Normalized tree representation.

use blueprint_core::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A normalized value: what a response tree looks like after every entity
/// has been pulled out into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Node {
    /// Any JSON value that is neither an object nor an array.
    Scalar(Value),
    /// Pointer to a store entry.
    Reference(EntityKey),
    List(Vec<Node>),
    /// An embedded object without its own identity.
    Object(BTreeMap<String, Node>),
}

impl Node {
    pub fn as_reference(&self) -> Option<&EntityKey> {
        match self {
            Self::Reference(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Every entity key referenced anywhere in this tree, in encounter order.
    pub fn references(&self) -> Vec<&EntityKey> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a EntityKey>) {
        match self {
            Self::Reference(key) => out.push(key),
            Self::List(items) => items.iter().for_each(|n| n.collect_references(out)),
            Self::Object(fields) => fields.values().for_each(|n| n.collect_references(out)),
            Self::Scalar(_) => {}
        }
    }
}

/// One normalized entity.
///
/// Fields are kept sorted so a serialized entry is byte-stable across
/// repeated merges of the same payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub typename: String,
    pub id: String,
    pub fields: BTreeMap<String, Node>,
}

impl CacheEntry {
    pub fn new(key: &EntityKey) -> Self {
        Self {
            typename: key.typename.clone(),
            id: key.id.clone(),
            fields: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.typename.clone(), self.id.clone())
    }

    pub fn field(&self, name: &str) -> Option<&Node> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_references_in_encounter_order() {
        let tree = Node::Object(BTreeMap::from([
            (
                "a".to_string(),
                Node::List(vec![
                    Node::Reference(EntityKey::new("Instance", "10")),
                    Node::Scalar(json!(1)),
                    Node::Reference(EntityKey::new("Instance", "11")),
                ]),
            ),
            ("b".to_string(), Node::Reference(EntityKey::new("Team", "2"))),
        ]));

        let keys: Vec<String> = tree.references().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Instance:10", "Instance:11", "Team:2"]);
    }

    #[test]
    fn test_node_serialization_is_tagged() {
        let node = Node::Reference(EntityKey::new("Component", "1"));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "reference");
        assert_eq!(json["value"]["typename"], "Component");
    }
}
