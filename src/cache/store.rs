//! Local in-memory cache owned by a node
//!
//! Byte values keyed by string, with:
//! - LRU eviction once `max_entries` is reached
//! - hit/miss/eviction statistics
//!
//! All methods take `&self`; the store is shared behind an `Arc` and
//! guarded by one internal lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

// =============================================================================
// Constants
// =============================================================================

/// Default maximum cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Entries kept before the least recently used one is evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug)]
struct CacheEntry {
    value: Vec<u8>,
    /// Last use, key into `lru_order`
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys by last use (first = least recently used)
    lru_order: BTreeMap<u64, String>,
    next_tick: u64,
    stats: CacheStats,
}

/// Thread-safe LRU cache of byte values
#[derive(Debug)]
pub struct Cache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Get a copy of the value stored under `key`
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.lock();

        let value = inner.entries.get(key).map(|e| e.value.clone());
        if value.is_some() {
            inner.stats.hits += 1;
            inner.touch(key);
        } else {
            inner.stats.misses += 1;
        }

        value
    }

    /// Store `value` under `key`, evicting the least recently used entry if full
    pub fn set(&self, key: &str, value: Vec<u8>) {
        if self.config.max_entries == 0 {
            return;
        }

        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.value = value;
            inner.touch(key);
        } else {
            let tick = inner.bump();
            inner.lru_order.insert(tick, key.to_string());
            inner.entries.insert(key.to_string(), CacheEntry { value, tick });
            while inner.entries.len() > self.config.max_entries {
                inner.evict_one();
            }
        }
        inner.stats.inserts += 1;
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.remove(key) {
            inner.lru_order.remove(&entry.tick);
            inner.stats.deletes += 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru_order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheInner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Mark `key` as most recently used
    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            let old = std::mem::replace(&mut entry.tick, tick);
            if let Some(k) = self.lru_order.remove(&old) {
                self.lru_order.insert(tick, k);
            }
        }
    }

    fn evict_one(&mut self) {
        if let Some((_, key)) = self.lru_order.pop_first() {
            if self.entries.remove(&key).is_some() {
                self.stats.evictions += 1;
            }
        }
    }
}

// =============================================================================
// Cache Statistics
// =============================================================================

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
