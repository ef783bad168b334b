//! Weight-bounded LRU cache.
//!
//! Capacity is measured in caller-defined weight units instead of entries.
//! Inserting evicts least-recently-used entries until the new entry fits or
//! the cache is empty, so a single entry heavier than the whole capacity is
//! still stored:
//!
//! ```text
//! weight ≤ max(capacity, heaviest single entry ever inserted)
//! ```
//!
//! All operations take one internal mutex, which makes recency updates and
//! eviction atomic with respect to each other.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

/// Cost function for cache entries.
pub trait Weigher<K, V>: Send + Sync {
    fn weigh(&self, key: &K, value: &V) -> usize;
}

impl<K, V, F> Weigher<K, V> for F
where
    F: Fn(&K, &V) -> usize + Send + Sync,
{
    fn weigh(&self, key: &K, value: &V) -> usize {
        self(key, value)
    }
}

struct Weighted<V> {
    value: V,
    weight: usize,
}

struct CacheInner<K: Hash + Eq, V> {
    entries: LruCache<K, Weighted<V>>,
    weight: usize,
}

impl<K: Hash + Eq, V> CacheInner<K, V> {
    fn take(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.pop(key)?;
        self.weight -= removed.weight;
        Some(removed.value)
    }
}

/// Cache counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    /// Lookups that skipped the cache entirely
    pub bypasses: usize,
    pub entries: usize,
    pub weight: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Thread-safe LRU cache bounded by total entry weight.
///
/// # Examples
///
/// ```
/// use handlegrip::cache::WeightedLruCache;
///
/// let cache = WeightedLruCache::new(10, |k: &&str, v: &String| k.len() + v.len());
/// cache.insert("a", "1234".to_string());
/// cache.insert("b", "1234".to_string());
/// assert_eq!(cache.current_weight(), 10);
///
/// // "a" is the least recently used entry and makes room for "c".
/// cache.insert("c", "xy".to_string());
/// assert!(cache.get("a").is_none());
/// assert_eq!(cache.get("b").as_deref(), Some("1234"));
///
/// // Passing `None` removes.
/// cache.put("b", None);
/// assert_eq!(cache.current_weight(), 3);
/// ```
pub struct WeightedLruCache<K: Hash + Eq, V, W = fn(&K, &V) -> usize> {
    inner: Mutex<CacheInner<K, V>>,
    weigher: W,
    capacity: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl<K, V, W> WeightedLruCache<K, V, W>
where
    K: Hash + Eq,
    V: Clone,
    W: Weigher<K, V>,
{
    pub fn new(capacity: usize, weigher: W) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                weight: 0,
            }),
            weigher,
            capacity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self
            .inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value.clone());

        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Insert or replace `key`; `None` removes it instead.
    ///
    /// Returns the value previously stored under `key`.
    pub fn put(&self, key: K, value: Option<V>) -> Option<V> {
        let Some(value) = value else {
            return self.remove(&key);
        };

        let weight = self.weigher.weigh(&key, &value);
        let mut inner = self.inner.lock();
        let previous = inner.take(&key);

        let mut evicted = 0;
        while inner.weight.saturating_add(weight) > self.capacity {
            let Some((_, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.weight -= entry.weight;
            evicted += 1;
        }

        inner.entries.put(key, Weighted { value, weight });
        inner.weight += weight;
        drop(inner);

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::trace!(evicted, weight, "evicted least recently used entries");
        }
        previous
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.put(key, Some(value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().take(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.weight = 0;
    }

    /// Sum of the weights of all stored entries.
    pub fn current_weight(&self) -> usize {
        self.inner.lock().weight
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, weight) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.weight)
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypasses: 0,
            entries,
            weight,
            capacity: self.capacity,
        }
    }
}
