//! Key/value cache with per-entry TTL
//!
//! Shared by the OIDC refresh path (`oidc-token-<raw token>` → refresh token)
//! and the node-drain jobs (job key → status string). Safe for concurrent use
//! from any number of handlers; callers never add their own locking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Cache lookup failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    /// Key absent or its entry expired
    #[error("key not found")]
    NotFound,
}

/// A cached value with TTL metadata
struct CachedEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Option<Duration>,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| Instant::now().duration_since(self.cached_at) > ttl)
    }
}

/// Thread-safe TTL cache
pub struct TtlCache<V> {
    entries: DashMap<String, CachedEntry<V>>,
    /// TTL applied by [`TtlCache::set`]; `None` keeps entries until overwritten
    default_ttl: Option<Duration>,
    evictions: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create a cache whose plain `set` uses `default_ttl`
    #[must_use]
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a value if present and not expired
    ///
    /// Expired entries are evicted on access.
    pub fn get(&self, key: &str) -> Result<V, CacheError> {
        let Some(entry) = self.entries.get(key) else {
            return Err(CacheError::NotFound);
        };

        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotFound);
        }

        Ok(entry.value.clone())
    }

    /// Store a value under the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.insert(key.into(), value, self.default_ttl);
    }

    /// Store a value with an explicit TTL
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.insert(key.into(), value, Some(ttl));
    }

    /// Remove a key, returning its value when it was live
    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.value)
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Evict expired entries (background maintenance)
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    fn insert(&self, key: String, value: V, ttl: Option<Duration>) {
        self.entries.insert(
            key,
            CachedEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Spawn a task that evicts expired entries every `interval` until shutdown
pub fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    cache: Arc<TtlCache<V>>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = cache.evict_expired();
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted expired cache entries");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}
