use crate::types::Key;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

/// Current cache state plus cumulative counters.
///
/// This is intended for observability (e.g. telemetry, debug overlays).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheMetrics {
    pub stats: CacheStats,
    pub entries: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    store: String,
    key: Key,
}

/// Memory-resident shadow copy of one stored record.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub store_name: String,
    pub key: Key,
    pub value: serde_json::Value,
    pub stored_at: i64,
    pub expires_at: Option<i64>,
    cached_until: Option<Instant>,
}

impl CacheEntry {
    pub fn new(
        store_name: &str,
        key: Key,
        value: serde_json::Value,
        stored_at: i64,
        expires_at: Option<i64>,
    ) -> Self {
        Self {
            store_name: store_name.to_string(),
            key,
            value,
            stored_at,
            expires_at,
            cached_until: None,
        }
    }

    /// Whether the record itself (not the cache slot) has passed its expiry.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now_ms)
    }
}

/// Per-`(store, key)` LRU cache with an optional time-to-live.
///
/// Eviction only drops the in-memory copy; the backing store is never touched
/// from here.
pub(crate) struct EntryCache {
    entries: LruCache<CacheKey, CacheEntry>,
    ttl: Option<Duration>,
    stats: CacheStats,
}

impl EntryCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, store: &str, key: &Key, now: Instant) -> Option<&CacheEntry> {
        let cache_key = CacheKey {
            store: store.to_string(),
            key: key.clone(),
        };

        let stale = match self.entries.peek(&cache_key) {
            None => {
                self.stats.misses = self.stats.misses.saturating_add(1);
                return None;
            }
            Some(entry) => entry.cached_until.is_some_and(|deadline| deadline <= now),
        };

        if stale {
            self.entries.pop(&cache_key);
            self.stats.expirations = self.stats.expirations.saturating_add(1);
            self.stats.misses = self.stats.misses.saturating_add(1);
            return None;
        }

        self.stats.hits = self.stats.hits.saturating_add(1);
        self.entries.get(&cache_key)
    }

    pub fn insert(&mut self, mut entry: CacheEntry, now: Instant) {
        entry.cached_until = self.ttl.and_then(|ttl| now.checked_add(ttl));
        let cache_key = CacheKey {
            store: entry.store_name.clone(),
            key: entry.key.clone(),
        };
        self.stats.insertions = self.stats.insertions.saturating_add(1);
        if let Some((evicted_key, _)) = self.entries.push(cache_key.clone(), entry) {
            // `push` hands back the previous value when the key already existed.
            if evicted_key != cache_key {
                self.stats.evictions = self.stats.evictions.saturating_add(1);
            }
        }
    }

    pub fn invalidate(&mut self, store: &str, key: &Key) {
        let cache_key = CacheKey {
            store: store.to_string(),
            key: key.clone(),
        };
        if self.entries.pop(&cache_key).is_some() {
            self.stats.invalidations = self.stats.invalidations.saturating_add(1);
        }
    }

    /// Drop every cached entry that belongs to `store`.
    pub fn invalidate_store(&mut self, store: &str) {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(k, _)| k.store == store)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.entries.pop(&key);
            self.stats.invalidations = self.stats.invalidations.saturating_add(1);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            stats: self.stats,
            entries: self.entries.len(),
            capacity: self.entries.cap().get(),
        }
    }
}
