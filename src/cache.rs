// src/cache.rs
//! In-memory TTL cache for rating statistics, keyed by movie id.
//!
//! Entries expire lazily: an expired entry stays in the map until the next
//! `get` for its key removes it. There is no background sweep and no count
//! bound, the key space is whatever movies the user has looked at.

use dashmap::DashMap;
use log::debug;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Freshness window used by `set` when no TTL is given.
pub const DEFAULT_RATING_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    payload: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(payload: V, ttl: Duration) -> Self {
        Self {
            payload,
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct RatingCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> fmt::Debug for RatingCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatingCache")
            .field("default_ttl", &self.default_ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<V: Clone> Default for RatingCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> RatingCache<V> {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_RATING_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached payload if it is still fresh. An expired entry is
    /// removed on the way out.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Rating cache HIT for movie {}", key);
                return Some(entry.payload.clone());
            }
        }

        // Re-checked under the shard lock so a concurrent fresh `set` survives.
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired())
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Rating cache entry for movie {} expired, evicted", key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Rating cache MISS for movie {}", key);
        None
    }

    pub fn set(&self, key: impl Into<String>, payload: V) {
        self.set_with_ttl(key, payload, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, payload: V, ttl: Duration) {
        let key = key.into();
        debug!("Rating cache SET for movie {} with TTL {:?}", key, ttl);
        self.entries.insert(key, CacheEntry::new(payload, ttl));
    }

    /// Drops the entry whatever its age. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!("Rating cache entry for movie {} invalidated", key);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        debug!("Rating cache cleared");
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            hit_rate,
        }
    }

    /// Read-through lookup: serves a fresh entry, otherwise awaits `fetch`
    /// and caches its value with the default TTL. Failed fetches cache nothing.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(payload) = self.get(key) {
            return Ok(payload);
        }
        let payload = fetch().await?;
        self.set(key, payload.clone());
        Ok(payload)
    }
}
