//! Structural equality and dependency-based memoization.

use blueprint_core::MemoError;
use serde::Serialize;
use serde_json::Value;

/// Structural equality over plain JSON data.
///
/// Objects are equal when they have the same key set and every value is
/// recursively equal; arrays compare element-wise. Numbers compare by value,
/// so `1` equals `1.0`. Inputs are assumed to be acyclic.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, v)| y.get(key).is_some_and(|w| deep_equal(v, w)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| deep_equal(v, w))
        }
        (Value::Number(x), Value::Number(y)) => {
            x == y || matches!((x.as_f64(), y.as_f64()), (Some(p), Some(q)) if p == q)
        }
        _ => a == b,
    }
}

/// [`deep_equal`] for any serializable values.
pub fn deep_equal_serialized<A, B>(a: &A, b: &B) -> Result<bool, MemoError>
where
    A: Serialize + ?Sized,
    B: Serialize + ?Sized,
{
    Ok(deep_equal(&to_value(a)?, &to_value(b)?))
}

/// Turn a serializable dependency tuple or slice into a dependency list.
///
/// Tuples and sequences serialize as arrays and yield one dependency per
/// element; any other value is a single dependency.
pub fn to_deps<D: Serialize + ?Sized>(deps: &D) -> Result<Vec<Value>, MemoError> {
    match to_value(deps)? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

/// True when `next` differs from `prev` under [`deep_equal`], element-wise.
///
/// A length change breaks the memo-site contract and always counts as a change.
pub fn deps_changed(prev: &[Value], next: &[Value]) -> bool {
    if prev.len() != next.len() {
        tracing::debug!(
            previous = prev.len(),
            next = next.len(),
            "Dependency list length changed between calls"
        );
        return true;
    }
    prev.iter().zip(next).any(|(p, n)| !deep_equal(p, n))
}

pub(crate) fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, MemoError> {
    serde_json::to_value(value).map_err(|e| MemoError::UnserializableKey {
        reason: e.to_string(),
    })
}

/// One memoized value guarded by a dependency list.
#[derive(Debug)]
pub struct DeepMemo<T> {
    deps: Option<Vec<Value>>,
    value: Option<T>,
    computations: u64,
}

impl<T> DeepMemo<T> {
    pub fn new() -> Self {
        Self {
            deps: None,
            value: None,
            computations: 0,
        }
    }

    /// Return the cached value, recomputing with `factory` when `deps` changed.
    pub fn get<F>(&mut self, deps: &[Value], factory: F) -> &T
    where
        F: FnOnce() -> T,
    {
        let changed = match &self.deps {
            Some(prev) => deps_changed(prev, deps),
            None => true,
        };
        if changed {
            self.deps = Some(deps.to_vec());
            self.value = None;
            self.computations += 1;
        }
        self.value.get_or_insert_with(factory)
    }

    /// [`DeepMemo::get`] with dependencies given as any serializable tuple.
    pub fn get_with<D, F>(&mut self, deps: &D, factory: F) -> Result<&T, MemoError>
    where
        D: Serialize + ?Sized,
        F: FnOnce() -> T,
    {
        let deps = to_deps(deps)?;
        Ok(self.get(&deps, factory))
    }

    pub fn peek(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// How many times the factory has run.
    pub fn computations(&self) -> u64 {
        self.computations
    }

    pub fn reset(&mut self) {
        self.deps = None;
        self.value = None;
    }
}

impl<T> Default for DeepMemo<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_deep_equal_nested() {
        assert!(deep_equal(&json!({"a": [1, {"b": 2}]}), &json!({"a": [1, {"b": 2}]})));
        assert!(!deep_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!deep_equal(&json!({"a": 1, "b": 2}), &json!({"a": 1})));
        assert!(!deep_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn test_deep_equal_arrays_of_objects() {
        let a = json!([{"id": 1, "tags": ["x"]}, {"id": 2, "tags": []}]);
        let b = json!([{"tags": ["x"], "id": 1}, {"id": 2, "tags": []}]);
        let c = json!([{"id": 1, "tags": ["y"]}, {"id": 2, "tags": []}]);
        assert!(deep_equal(&a, &b));
        assert!(!deep_equal(&a, &c));
    }

    #[test]
    fn test_deep_equal_primitives() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(deep_equal(&json!("x"), &json!("x")));
        assert!(!deep_equal(&json!("1"), &json!(1)));
        assert!(!deep_equal(&Value::Null, &json!(false)));
        assert!(!deep_equal(&json!({}), &json!([])));
    }

    #[test]
    fn test_deep_equal_serialized() {
        #[derive(Serialize)]
        struct Filter {
            team: &'static str,
            limit: u32,
        }
        let a = Filter { team: "core", limit: 10 };
        assert!(deep_equal_serialized(&a, &json!({"limit": 10, "team": "core"})).unwrap());
    }

    #[test]
    fn test_deep_memo_recomputes_only_on_change() {
        let mut memo = DeepMemo::new();

        let first = *memo.get(&[json!({"team": "core"}), json!(1)], || 10);
        let second = *memo.get(&[json!({"team": "core"}), json!(1)], || 20);
        assert_eq!(first, 10);
        assert_eq!(second, 10);
        assert_eq!(memo.computations(), 1);

        let third = *memo.get(&[json!({"team": "edge"}), json!(1)], || 30);
        assert_eq!(third, 30);
        assert_eq!(memo.computations(), 2);
    }

    #[test]
    fn test_deep_memo_length_change_counts_as_change() {
        let mut memo = DeepMemo::new();
        memo.get(&[json!(1)], || "a");
        let value = *memo.get(&[json!(1), json!(2)], || "b");
        assert_eq!(value, "b");
    }

    #[test]
    fn test_deep_memo_with_tuple_deps() {
        let mut memo = DeepMemo::new();
        let v = *memo.get_with(&("Component", 3), || 1).unwrap();
        let w = *memo.get_with(&("Component", 3), || 2).unwrap();
        assert_eq!((v, w), (1, 1));

        memo.reset();
        assert!(memo.peek().is_none());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_deep_equal_is_reflexive(v in arb_json()) {
            prop_assert!(deep_equal(&v, &v.clone()));
        }

        #[test]
        fn prop_deep_equal_is_symmetric(a in arb_json(), b in arb_json()) {
            prop_assert_eq!(deep_equal(&a, &b), deep_equal(&b, &a));
        }
    }
}
