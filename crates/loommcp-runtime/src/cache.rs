//! TTL cache of resource content.
//!
//! Maps a resource URI to an owned sequence of content items with a
//! per-entry expiry. Lookups and stores deep-copy, so cached content is
//! never shared mutably with handlers. Eviction at capacity prefers expired
//! entries and falls back to the oldest insertion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use loommcp_core::ContentItem;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// TTL applied when `put` does not specify one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned content.
    pub hits: u64,
    /// Lookups that missed or hit an expired entry.
    pub misses: u64,
    /// Entries discarded to make room.
    pub evictions: u64,
}

struct CacheEntry {
    items: Vec<ContentItem>,
    expires_at: Instant,
    inserted_seq: u64,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    seq: u64,
}

/// A bounded URI → content cache with per-entry TTL.
pub struct ResourceCache {
    inner: RwLock<CacheInner>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResourceCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                seq: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a URI; a hit returns a deep copy of the stored items.
    ///
    /// Expired entries count as misses; their memory is reclaimed by the
    /// next write that needs the room or by [`ResourceCache::purge_expired`].
    pub fn get(&self, uri: &str) -> Option<Vec<ContentItem>> {
        self.get_at(uri, Instant::now())
    }

    /// [`ResourceCache::get`] with an injected clock, for tests.
    pub fn get_at(&self, uri: &str, now: Instant) -> Option<Vec<ContentItem>> {
        let inner = self.inner.read();
        match inner.map.get(uri) {
            Some(entry) if now < entry.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.items.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a deep copy of `items` under `uri`.
    ///
    /// Uses the default TTL when `ttl` is `None`. At capacity, evicts one
    /// entry (an expired one when available, else the oldest insertion).
    pub fn put(&self, uri: impl Into<String>, items: &[ContentItem], ttl: Option<Duration>) {
        self.put_at(uri, items, ttl, Instant::now());
    }

    /// [`ResourceCache::put`] with an injected clock, for tests.
    pub fn put_at(
        &self,
        uri: impl Into<String>,
        items: &[ContentItem],
        ttl: Option<Duration>,
        now: Instant,
    ) {
        if self.config.capacity == 0 {
            return;
        }
        let uri = uri.into();
        // Build the entry completely before touching the table so a failed
        // copy can never leave partial state behind the lock.
        let entry = CacheEntry {
            items: items.to_vec(),
            expires_at: now + ttl.unwrap_or(self.config.default_ttl),
            inserted_seq: 0,
        };

        let mut inner = self.inner.write();
        if !inner.map.contains_key(&uri) && inner.map.len() >= self.config.capacity {
            self.evict_one(&mut inner, now);
        }
        inner.seq += 1;
        let seq = inner.seq;
        trace!(%uri, "cache store");
        inner.map.insert(
            uri,
            CacheEntry {
                inserted_seq: seq,
                ..entry
            },
        );
    }

    /// Drop a single entry.
    pub fn invalidate(&self, uri: &str) -> bool {
        self.inner.write().map.remove(uri).is_some()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.write().map.clear();
    }

    /// Remove every expired entry now rather than lazily.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.inner.write().map.retain(|_, e| now < e.expires_at);
    }

    /// Current entry count, expired entries included.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_one(&self, inner: &mut CacheInner, now: Instant) {
        let victim = inner
            .map
            .iter()
            .find(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .or_else(|| {
                inner
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_seq)
                    .map(|(k, _)| k.clone())
            });
        if let Some(key) = victim {
            trace!(uri = %key, "cache evict");
            inner.map.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
