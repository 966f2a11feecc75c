//! Response cache
//!
//! Bounded key/value store with a per-entry TTL and least-recently-used
//! eviction. Used for whole answers keyed on normalized query text and for
//! data source results keyed on the fetch parameters.
//!
//! Expired entries are dropped lazily on lookup; [`ResponseCache::spawn_sweeper`]
//! purges the rest in the background.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Cache sizing and lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of answers kept
    pub capacity: usize,

    /// Lifetime of a cached answer
    pub query_ttl_secs: u64,

    /// Maximum number of data source results kept
    pub source_capacity: usize,

    /// Interval of the background purge; 0 disables it
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            query_ttl_secs: 300,
            source_capacity: 200,
            sweep_interval_secs: 60,
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Opaque cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Use `raw` verbatim as the key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for a query: normalized text plus the chosen context fields.
    ///
    /// Texts differing only in case or whitespace map to the same key.
    pub fn for_query(text: &str, context: &BTreeMap<String, String>) -> Self {
        let mut canonical = normalize_text(text);
        for (field, value) in context {
            canonical.push('\u{1f}');
            canonical.push_str(field);
            canonical.push('=');
            canonical.push_str(value);
        }
        Self::digest(&canonical)
    }

    /// Hash arbitrary material into a fixed-width key.
    pub fn digest(material: &str) -> Self {
        Self(blake3::hash(material.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Entries and statistics
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
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

struct CacheState<V> {
    entries: LruCache<CacheKey, CacheEntry<V>>,
    stats: CacheStats,
}

// ============================================================================
// Cache
// ============================================================================

/// TTL + LRU cache safe for concurrent use
pub struct ResponseCache<V> {
    state: Mutex<CacheState<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> ResponseCache<V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            capacity: capacity.get(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.entries.get_mut(key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                state.stats.hits += 1;
                trace!("cache hit for {} ({} hits)", key, entry.hit_count);
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        state.entries.pop(key);
        state.stats.expirations += 1;
        state.stats.misses += 1;
        None
    }

    /// Store `value` under `key` for `ttl`, evicting the LRU entry when full.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.entries.contains(&key) && state.entries.len() >= self.capacity {
            if let Some((evicted, _)) = state.entries.pop_lru() {
                state.stats.evictions += 1;
                debug!("evicted least recently used entry {}", evicted);
            }
        }

        state.entries.put(key, entry);
    }

    /// Store `value` with the cache's default TTL.
    pub fn insert(&self, key: CacheKey, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Time since `key` was stored, without touching its recency.
    pub fn age(&self, key: &CacheKey) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.saturating_duration_since(entry.created_at))
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.state.lock().entries.pop(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.pop(key);
        }
        state.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            ..state.stats.clone()
        }
    }
}

impl<V: Clone + Send + 'static> ResponseCache<V> {
    /// Spawn the sweeper when `interval` is non-zero and a runtime is running.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no tokio runtime; expired cache entries are only dropped on lookup");
            return None;
        }
        Some(self.spawn_sweeper(interval))
    }

    /// Purge expired entries every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("cache sweeper purged {} expired entries", purged);
                }
            }
        })
    }
}
