//! LRU memo for pure functions.
//!
//! Arguments are keyed by their canonical JSON serialization, so only
//! serializable plain data can be used as arguments. Anything serde_json
//! cannot represent is rejected with [`MemoError::UnserializableKey`]
//! rather than hashed by some guess.

use blueprint_core::{canonical_json, ConfigError, MemoError};
use lru::LruCache;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::equality::to_value;

/// Hit/miss/eviction counters for a memo.
#[derive(Debug, Default)]
pub struct MemoStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Memoizes `factory(args)` in a fixed-capacity LRU.
///
/// Every access moves the key to the most-recently-used position; inserting
/// a new key at capacity evicts the least recently used one.
pub struct LruMemo<A: ?Sized, T> {
    factory: Box<dyn Fn(&A) -> T + Send + Sync>,
    cache: Mutex<LruCache<String, T>>,
    stats: MemoStats,
    _args: PhantomData<fn(&A)>,
}

impl<A, T> LruMemo<A, T>
where
    A: Serialize + ?Sized,
    T: Clone,
{
    /// Create a memo holding at most `capacity` results.
    ///
    /// A zero capacity is rejected: a memo that can never hold a value is a
    /// configuration mistake, not a valid "never cache" mode.
    pub fn new<F>(capacity: usize, factory: F) -> Result<Self, ConfigError>
    where
        F: Fn(&A) -> T + Send + Sync + 'static,
    {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| ConfigError::InvalidValue {
            field: "capacity".to_string(),
            value: capacity.to_string(),
            reason: "LRU memo capacity must be at least 1".to_string(),
        })?;
        Ok(Self {
            factory: Box::new(factory),
            cache: Mutex::new(LruCache::new(capacity)),
            stats: MemoStats::default(),
            _args: PhantomData,
        })
    }

    /// Return the memoized result for `args`, computing it on a miss.
    ///
    /// The factory runs outside the cache lock, so it may itself use the memo.
    pub fn call(&self, args: &A) -> Result<T, MemoError> {
        let key = Self::key_for(args)?;

        if let Some(value) = self.lock().get(key.as_str()) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let value = (self.factory)(args);

        if let Some((evicted, _)) = self.lock().push(key.clone(), value.clone()) {
            if evicted != key {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(evicted = %evicted, "LRU memo evicted least recently used key");
            }
        }
        Ok(value)
    }

    /// Whether `args` is cached, without touching recency.
    pub fn contains(&self, args: &A) -> Result<bool, MemoError> {
        let key = Self::key_for(args)?;
        Ok(self.lock().contains(key.as_str()))
    }

    /// Cached keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> &MemoStats {
        &self.stats
    }

    fn key_for(args: &A) -> Result<String, MemoError> {
        Ok(canonical_json(&to_value(args)?))
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, T>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: ?Sized, T> fmt::Debug for LruMemo<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LruMemo")
            .field("capacity", &cache.cap())
            .field("len", &cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde::Serializer;
    use std::sync::Arc;

    fn upper_memo(capacity: usize) -> (LruMemo<str, String>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let memo = LruMemo::new(capacity, move |s: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            s.to_uppercase()
        })
        .unwrap();
        (memo, calls)
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let (memo, _) = upper_memo(2);

        memo.call("A").unwrap();
        memo.call("B").unwrap();
        memo.call("C").unwrap();
        assert!(!memo.contains("A").unwrap());
        assert!(memo.contains("B").unwrap());
        assert!(memo.contains("C").unwrap());

        // touching B makes C the eviction victim
        memo.call("B").unwrap();
        memo.call("D").unwrap();
        assert!(memo.contains("B").unwrap());
        assert!(!memo.contains("C").unwrap());
        assert!(memo.contains("D").unwrap());
        assert_eq!(memo.stats().evictions(), 2);
    }

    #[test]
    fn test_lru_hit_skips_factory() {
        let (memo, calls) = upper_memo(4);
        assert_eq!(memo.call("x").unwrap(), "X");
        assert_eq!(memo.call("x").unwrap(), "X");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.stats().hits(), 1);
        assert_eq!(memo.stats().misses(), 1);
        assert!((memo.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lru_keys_most_recent_first() {
        let (memo, _) = upper_memo(3);
        memo.call("a").unwrap();
        memo.call("b").unwrap();
        memo.call("a").unwrap();
        assert_eq!(memo.keys(), vec![r#""a""#, r#""b""#]);
    }

    #[test]
    fn test_lru_rejects_zero_capacity() {
        let result = LruMemo::<str, String>::new(0, |s: &str| s.to_string());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_lru_structured_args_are_order_insensitive() {
        let memo = LruMemo::new(2, |v: &serde_json::Value| v.to_string().len()).unwrap();
        memo.call(&serde_json::json!({"a": 1, "b": 2})).unwrap();
        assert!(memo
            .contains(&serde_json::json!({"b": 2, "a": 1}))
            .unwrap());
    }

    struct Opaque;

    impl Serialize for Opaque {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("opaque handles cannot be keyed"))
        }
    }

    #[test]
    fn test_lru_rejects_unserializable_args() {
        let memo = LruMemo::new(2, |_: &Opaque| 1).unwrap();
        let err = memo.call(&Opaque).unwrap_err();
        assert!(matches!(err, MemoError::UnserializableKey { .. }));
        assert!(memo.is_empty());
    }
}
