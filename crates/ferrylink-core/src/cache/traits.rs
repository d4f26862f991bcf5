//! Cache tier trait and shared types.

use crate::config::{option_duration_secs, CacheDefaults};
use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the two cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    /// Maximum number of entries held in memory.
    pub memory_capacity: u64,
    /// Upper bound on how long any entry lives in memory, regardless of its
    /// own expiry. `None` leaves memory entries bounded by capacity only.
    #[serde(with = "option_duration_secs")]
    pub memory_ttl: Option<Duration>,
    /// Freshness window the pipeline writes responses with.
    #[serde(with = "crate::config::duration_secs")]
    pub persistent_ttl: Duration,
    /// SQLite database backing the persistent tier. `None` disables it.
    pub database_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: CacheDefaults::MEMORY_CAPACITY,
            memory_ttl: None,
            persistent_ttl: CacheDefaults::PERSISTENT_TTL,
            database_path: None,
        }
    }
}

/// A cached value with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        // A TTL too large to represent is treated as no expiry.
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        Self { value, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Durable key-value byte store with per-key expiry.
///
/// All operations are synchronous to match rusqlite's API.
pub trait PersistentStore: Send + Sync {
    /// Get a live entry. Expired entries are deleted and reported as absent.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite an entry.
    fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every entry.
    fn clear(&self) -> Result<()>;

    /// Delete all expired entries, returning how many were removed.
    fn cleanup_expired(&self) -> Result<usize>;

    /// Number of stored entries, expired or not.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
