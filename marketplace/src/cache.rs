//! Read-through cache for browse paths.
//!
//! Event availability is the hot read of the marketplace. It is cached
//! behind the [`Cache`] trait and every write that changes tier or event
//! counters invalidates the affected event explicitly.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Key/value cache capability injected into read paths
pub trait Cache<K, V>: Send + Sync {
    /// Cached value, if present and fresh
    fn get(&self, key: &K) -> Option<V>;

    /// Stores a value
    fn put(&self, key: K, value: V);

    /// Drops a value after a write made it stale
    fn invalidate(&self, key: &K);
}

#[derive(Clone, Debug)]
struct CachedEntry<V> {
    value: V,
    cached_at: Instant,
    last_accessed: Instant,
}

/// Cache statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current size
    pub size: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, CachedEntry<V>>,
    hits: u64,
    misses: u64,
}

/// Bounded in-process cache with TTL and least-recently-used eviction
#[derive(Debug)]
pub struct InMemoryCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create new cache with capacity and TTL
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl<K, V> Default for InMemoryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(300))
    }
}

impl<K, V> Cache<K, V> for InMemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let ttl = self.ttl;
        let mut inner = self.lock();
        let expired = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.cached_at.elapsed() > ttl);
        if expired {
            inner.entries.remove(key);
        }
        let fresh = inner.entries.get_mut(key).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.value.clone()
        });
        if fresh.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        fresh
    }

    fn put(&self, key: K, value: V) {
        let ttl = self.ttl;
        let mut inner = self.lock();
        inner.entries.retain(|_, entry| entry.cached_at.elapsed() <= ttl);

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                inner.entries.remove(&lru);
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            key,
            CachedEntry {
                value,
                cached_at: now,
                last_accessed: now,
            },
        );
    }

    fn invalidate(&self, key: &K) {
        self.lock().entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_invalidate() {
        let cache: InMemoryCache<u32, String> = InMemoryCache::default();
        assert_eq!(cache.get(&1), None);

        cache.put(1, "one".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));

        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(
            cache.stats(),
            CacheStats {
                size: 0,
                hits: 1,
                misses: 2
            }
        );
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache: InMemoryCache<u32, u32> = InMemoryCache::new(2, Duration::from_secs(60));
        cache.put(1, 10);
        cache.put(2, 20);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), Some(10));

        cache.put(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache: InMemoryCache<u32, u32> = InMemoryCache::new(4, Duration::ZERO);
        cache.put(1, 10);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), None);
    }
}
