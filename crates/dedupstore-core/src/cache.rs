//! Bounded LRU + TTL cache in front of the record store read path.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Configuration for the hash lookup cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupCacheConfig {
    /// Maximum number of entries (default 1000).
    pub capacity: usize,
    /// Seconds an entry stays valid after insertion (default 3600).
    pub ttl_secs: u64,
}

impl Default for LookupCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 3600,
        }
    }
}

/// Counters for the lookup cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupCacheStats {
    /// Current entry count.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that missed, including expired entries.
    pub misses: u64,
    /// Entries pushed out by capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

impl LookupCacheStats {
    /// Fraction of lookups that hit. Returns 0.0 if there have been no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// LRU cache whose entries also expire a fixed time after insertion.
pub struct HashLookupCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, CacheEntry<V>>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> HashLookupCache<K, V> {
    /// Cache sized from config. A zero capacity is bumped to one.
    pub fn new(config: &LookupCacheConfig) -> Self {
        Self::with_ttl(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    /// Cache with an explicit TTL.
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a key, refreshing its recency. Expired entries are removed and count as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            trace!("lookup cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace a value, evicting the least recently used entry when full.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let replacing = inner.contains(&key);
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        if inner.push(key, entry).is_some() && !replacing {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True if a live entry exists. Does not touch recency or counters.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .lock()
            .peek(key)
            .is_some_and(|e| e.inserted_at.elapsed() <= self.ttl)
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &K) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize
    where
        K: Clone,
    {
        let mut inner = self.inner.lock();
        let stale: Vec<K> = inner
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &stale {
            inner.pop(k);
        }
        self.expirations
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    /// Current entry count, expired entries included until touched.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> LookupCacheStats {
        LookupCacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
