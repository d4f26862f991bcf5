//! Two-tier cache composed from the memory and persistent tiers.

use super::memory::MemoryCache;
use super::sqlite::SqliteCache;
use super::traits::{CacheConfig, CacheEntry, PersistentStore};
use crate::error::Result;
use crate::request::decode_json;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Memory-first cache with an optional durable tier behind it.
///
/// Reads consult memory, then the persistent tier; persistent hits are
/// promoted into memory before being returned. An entry written with a TTL
/// expires at the same instant in both tiers.
#[derive(Clone)]
pub struct CacheStore {
    memory: MemoryCache,
    persistent: Option<Arc<dyn PersistentStore>>,
    default_ttl: Duration,
}

impl CacheStore {
    /// Memory-only cache.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: MemoryCache::new(config),
            persistent: None,
            default_ttl: config.persistent_ttl,
        }
    }

    /// Cache backed by the given persistent tier.
    pub fn with_persistent(config: &CacheConfig, persistent: Arc<dyn PersistentStore>) -> Self {
        Self {
            persistent: Some(persistent),
            ..Self::new(config)
        }
    }

    /// Build from configuration, opening the SQLite tier when a database path
    /// is configured.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match &config.database_path {
            Some(path) => {
                let sqlite = SqliteCache::new(path)?;
                if let Err(e) = sqlite.cleanup_expired() {
                    warn!("Failed to clean up expired cache entries: {}", e);
                }
                Ok(Self::with_persistent(config, Arc::new(sqlite)))
            }
            None => Ok(Self::new(config)),
        }
    }

    /// Freshness window used for pipeline-written responses.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn has_persistent_tier(&self) -> bool {
        self.persistent.is_some()
    }

    /// Look a key up in memory, then in the persistent tier.
    ///
    /// A failing persistent tier is logged and treated as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(entry) = self.memory.get(key) {
            debug!("Memory cache hit for {}", key);
            return Some(entry.value);
        }

        let persistent = self.persistent.as_ref()?;
        match persistent.get(key) {
            Ok(Some(entry)) => {
                debug!("Persistent cache hit for {}, promoting to memory", key);
                let value = entry.value.clone();
                self.memory.insert(key, entry);
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Persistent cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Look a key up and decode it as JSON.
    ///
    /// A cached value that no longer decodes into `T` is reported as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match decode_json(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Cached value for {} did not decode: {}", key, e);
                None
            }
        }
    }

    /// Store a value.
    ///
    /// Memory is always written. The persistent tier is written only when a
    /// TTL is given; both tiers then share the same expiry instant.
    pub fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let entry = CacheEntry::new(value, ttl);

        if ttl.is_some() {
            if let Some(persistent) = &self.persistent {
                if let Err(e) = persistent.set(key, &entry) {
                    warn!("Persistent cache write failed for {}: {}", key, e);
                }
            }
        }

        self.memory.insert(key, entry);
    }

    /// Remove a key from both tiers.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.memory.invalidate(key);
        if let Some(persistent) = &self.persistent {
            persistent.remove(key)?;
        }
        Ok(())
    }

    /// Remove everything from both tiers.
    pub fn clear(&self) -> Result<()> {
        self.memory.clear();
        if let Some(persistent) = &self.persistent {
            persistent.clear()?;
        }
        Ok(())
    }

    /// Whether the memory tier holds a live entry for `key`.
    pub fn contains_memory(&self, key: &str) -> bool {
        self.memory.contains(key)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
