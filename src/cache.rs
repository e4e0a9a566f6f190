//! Result cache for external calls.
//!
//! Keys are content hashes of the call arguments, so the same arguments
//! reach the same entry across retries and resumed runs. Capacity is a hard
//! bound on entry count; overflow evicts the entry inserted longest ago.
//! Lookups never refresh an entry's position. There is no expiry.
//!
//! The cache is shared by reference across pool workers, so every
//! operation takes an internal lock for the duration of one map access.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use lru::LruCache;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Cache settings for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false the engine hands processing no cache at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_capacity(),
        }
    }
}

/// Deterministic key derived from call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash the JSON serialization of `args`.
    ///
    /// Equal arguments give equal keys as long as their serialization is
    /// deterministic: prefer structs, tuples, `Vec` and `BTreeMap` over
    /// `HashMap` for anything that goes into a key.
    pub fn from_args<T: Serialize + ?Sized>(args: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(args)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Hash raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// A cached value and when it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: DateTime<Utc>,
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Bounded, insertion-ordered, thread-safe memo of external results.
pub struct ResultCache<V> {
    entries: Mutex<LruCache<CacheKey, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::Config("cache capacity must be greater than zero".into()))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Build from config; `None` when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Result<Option<Self>> {
        if config.enabled {
            Self::new(config.capacity).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Look up a value. Does not change eviction order.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let found = self.entries.lock().peek(key).map(|entry| entry.value.clone());
        let (counter, label) = if found.is_some() {
            (&self.hits, "hit")
        } else {
            (&self.misses, "miss")
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::cache_lookups().add(1, &[KeyValue::new("result", label)]);
        trace!(key = %key, result = label, "cache lookup");
        found
    }

    /// Look up a value together with its insertion time.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries.lock().peek(key).cloned()
    }

    /// Store a value, evicting the oldest insertion when full.
    ///
    /// A key that is already cached keeps its first value and its place in
    /// eviction order; the new value is dropped. Returns whether `value` was
    /// stored.
    pub fn put(&self, key: CacheKey, value: V) -> bool {
        self.insert_if_absent(key, value).is_none()
    }

    /// Return the cached value for `key`, or run `fetch` and cache its
    /// success. Failures are returned and not cached.
    ///
    /// The lock is not held while `fetch` runs, so two workers missing on
    /// the same key at once may both fetch. The first insert wins and both
    /// callers get its value.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch().await?;
        Ok(self.insert_if_absent(key, value.clone()).unwrap_or(value))
    }

    /// Insert unless present. Returns the value already cached, if any.
    fn insert_if_absent(&self, key: CacheKey, value: V) -> Option<V> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.peek(&key) {
            trace!(key = %key, "cache insert skipped, key present");
            return Some(existing.value.clone());
        }
        let entry = CacheEntry {
            value,
            inserted_at: Utc::now(),
        };
        if let Some((evicted, _)) = entries.push(key, entry) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(key = %evicted, "cache eviction");
        }
        None
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V> std::fmt::Debug for ResultCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ResultCache")
            .field("entries", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: u32) -> CacheKey {
        CacheKey::from_args(&("lookup", n)).unwrap()
    }

    #[test]
    fn same_args_same_key() {
        let a = CacheKey::from_args(&("geo", "Berlin", 3)).unwrap();
        let b = CacheKey::from_args(&("geo", "Berlin", 3)).unwrap();
        let c = CacheKey::from_args(&("geo", "Paris", 3)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn get_after_put_returns_stored_value() {
        let cache = ResultCache::new(4).unwrap();
        cache.put(key(1), "one".to_string());
        assert_eq!(cache.get(&key(1)), Some("one".to_string()));
        assert_eq!(cache.get(&key(2)), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn overflow_evicts_oldest_insertion_even_if_recently_read() {
        let cache = ResultCache::new(2).unwrap();
        cache.put(key(1), 1);
        cache.put(key(2), 2);
        // A read must not protect key 1.
        assert_eq!(cache.get(&key(1)), Some(1));
        cache.put(key(3), 3);

        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn repeated_put_keeps_first_value_and_position() {
        let cache = ResultCache::new(2).unwrap();
        assert!(cache.put(key(1), 1));
        assert!(cache.put(key(2), 2));
        assert!(!cache.put(key(1), 10));
        assert_eq!(cache.get(&key(1)), Some(1));

        // Key 1 is still the oldest insertion.
        cache.put(key(3), 3);
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn racing_fetch_gets_the_first_inserted_value() {
        let cache = ResultCache::new(4).unwrap();
        let value: std::result::Result<u32, String> = cache
            .get_or_insert_with(key(5), || async {
                // Another worker finishes first.
                cache.put(key(5), 50);
                Ok(99)
            })
            .await;
        assert_eq!(value, Ok(50));
        assert_eq!(cache.get(&key(5)), Some(50));
    }

    #[test]
    fn zero_capacity_is_a_config_error() {
        assert!(matches!(ResultCache::<u8>::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn disabled_config_builds_no_cache() {
        let config = CacheConfig {
            enabled: false,
            capacity: 10,
        };
        assert!(ResultCache::<u8>::from_config(&config).unwrap().is_none());
        assert!(
            ResultCache::<u8>::from_config(&CacheConfig::default())
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn get_or_insert_with_fetches_once_and_skips_failures() {
        let cache = ResultCache::new(8).unwrap();
        let mut calls = 0;

        let first: std::result::Result<u32, String> = cache
            .get_or_insert_with(key(7), || {
                calls += 1;
                async { Ok(70) }
            })
            .await;
        assert_eq!(first, Ok(70));

        let second: std::result::Result<u32, String> = cache
            .get_or_insert_with(key(7), || {
                calls += 1;
                async { Ok(0) }
            })
            .await;
        assert_eq!(second, Ok(70));
        assert_eq!(calls, 1);

        let failed: std::result::Result<u32, String> = cache
            .get_or_insert_with(key(8), || async { Err("timeout".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(!cache.contains(&key(8)));
    }

    proptest! {
        #[test]
        fn holds_exactly_the_newest_insertions(capacity in 1usize..16, inserts in 0u32..64) {
            let cache = ResultCache::new(capacity).unwrap();
            for n in 0..inserts {
                cache.put(key(n), n);
            }
            let kept = (inserts as usize).min(capacity);
            prop_assert_eq!(cache.len(), kept);
            for n in 0..inserts {
                let expected = (n as usize) >= inserts as usize - kept;
                prop_assert_eq!(cache.contains(&key(n)), expected);
            }
        }
    }
}
