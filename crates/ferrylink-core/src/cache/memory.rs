//! Bounded in-memory cache tier.

use super::traits::{CacheConfig, CacheEntry};
use mini_moka::sync::Cache;

/// Capacity-bounded memory tier.
///
/// Eviction is delegated to mini-moka (TinyLFU admission with LRU eviction).
/// Each entry additionally carries its own absolute expiry, checked on read.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.memory_capacity);
        if let Some(ttl) = config.memory_ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            inner: builder.build(),
        }
    }

    /// Get a live entry, evicting it first if it has expired.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let key = key.to_string();
        let entry = self.inner.get(&key)?;
        if entry.is_expired() {
            self.inner.invalidate(&key);
            return None;
        }
        Some(entry)
    }

    pub fn insert(&self, key: &str, entry: CacheEntry) {
        self.inner.insert(key.to_string(), entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(&key.to_string());
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}
