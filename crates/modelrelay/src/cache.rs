//! Bounded response cache with TTL and least-recently-used eviction.
//!
//! Keyed by a `(prompt, config)` fingerprint. A single shared instance is
//! consulted by every orchestrator call, so all read-modify-write sequences
//! (size accounting, recency bumps, eviction) run under one lock scoped to
//! the individual `get`/`set`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{GenerationConfig, GenerationResult};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on the summed serialized size of live entries
    pub max_size_bytes: usize,
    /// Entries older than this are expired on lookup
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 5 * 1024 * 1024,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size_bytes(mut self, bytes: usize) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Read-only metrics snapshot for dashboards and logging.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size_bytes: usize,
    pub max_size_bytes: usize,
}

#[derive(Debug)]
struct CacheEntry {
    value: GenerationResult,
    stored_at: Instant,
    /// Monotonic recency tick; the entry with the smallest tick is the LRU
    last_used: u64,
    hit_count: u64,
    size_bytes: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    tick: u64,
}

impl CacheState {
    /// Evict the least-recently-used entry (by last access, not insertion).
    /// Returns false when the cache is empty.
    fn evict_lru(&mut self) -> bool {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        match lru_key {
            Some(key) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.current_size_bytes -= entry.size_bytes;
                    self.evictions += 1;
                    debug!(key = %key, size_bytes = entry.size_bytes, "evicted LRU cache entry");
                }
                true
            }
            None => false,
        }
    }
}

/// Bounded, TTL-aware LRU cache for completed generation results.
pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Deterministic fingerprint for a `(prompt, config)` pair.
    ///
    /// The config is serialized through `serde_json::Value`, whose object
    /// map keeps keys lexicographically sorted, so equal inputs always
    /// produce equal keys across processes. The full content is embedded
    /// (no hashing), so distinct pairs cannot collide.
    pub fn generate_key(prompt: &str, config: &GenerationConfig) -> String {
        let serialized = serde_json::to_value(config)
            .map(|v| v.to_string())
            .unwrap_or_else(|_| format!("{config:?}"));
        format!("{prompt}:{serialized}")
    }

    /// Look up a cached result.
    ///
    /// Expired entries are removed, counted as a miss plus an eviction.
    /// Live hits bump the entry's hit count and recency.
    pub async fn get(&self, key: &str) -> Option<GenerationResult> {
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.stored_at.elapsed() > self.config.ttl,
        };

        if expired {
            if let Some(entry) = state.entries.remove(key) {
                state.current_size_bytes -= entry.size_bytes;
            }
            state.misses += 1;
            state.evictions += 1;
            debug!(key = %key, "cache entry expired");
            return None;
        }

        state.tick += 1;
        state.hits += 1;
        let tick = state.tick;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_used = tick;
                Some(entry.value.clone())
            }
            // Unreachable: presence was checked under the same lock
            None => None,
        }
    }

    /// Insert a result, evicting least-recently-used entries until the new
    /// total fits the size budget. Replacing an existing key never double
    /// counts its size.
    pub async fn set(&self, key: &str, value: GenerationResult) {
        let size_bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                warn!(error = %e, "cache size estimate degraded to 0");
                0
            }
        };

        if size_bytes > self.config.max_size_bytes {
            warn!(
                size_bytes,
                max_size_bytes = self.config.max_size_bytes,
                "value larger than the whole cache budget, not stored"
            );
            return;
        }

        let mut state = self.state.lock().await;

        if let Some(previous) = state.entries.remove(key) {
            state.current_size_bytes -= previous.size_bytes;
        }

        while state.current_size_bytes + size_bytes > self.config.max_size_bytes {
            if !state.evict_lru() {
                break;
            }
        }

        state.tick += 1;
        let tick = state.tick;
        state.current_size_bytes += size_bytes;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                last_used: tick,
                hit_count: 0,
                size_bytes,
            },
        );
    }

    /// Drop all entries and zero every counter.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = CacheState::default();
    }

    /// Immutable metrics snapshot.
    pub async fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock().await;
        CacheMetrics {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            current_size_bytes: state.current_size_bytes,
            max_size_bytes: self.config.max_size_bytes,
        }
    }

    /// Hit rate over all lookups; 0 when the cache has not been queried.
    pub async fn hit_rate(&self) -> f64 {
        let state = self.state.lock().await;
        let total = state.hits + state.misses;
        if total == 0 {
            0.0
        } else {
            state.hits as f64 / total as f64
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
