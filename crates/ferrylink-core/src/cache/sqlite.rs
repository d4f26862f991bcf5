//! SQLite-backed persistent cache tier.

use super::traits::{CacheEntry, PersistentStore};
use crate::error::{FerryError, Result};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// SQLite-based persistent store.
///
/// Rows are keyed by the SHA-256 digest of the cache key, so arbitrary paths
/// and query strings never need escaping. Thread-safe via an internal mutex on
/// the connection.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    /// Open (or create) a cache database at the given path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FerryError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| FerryError::Database {
            message: format!("Failed to open cache database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FerryError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::from_connection(conn)
    }

    /// In-memory database, for tests and throwaway pipelines.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FerryError::Database {
            message: format!("Failed to open in-memory cache: {}", e),
            source: Some(e),
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key_digest TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                cached_at TEXT NOT NULL,
                expires_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_cache_expires
                ON cache_entries(expires_at);
            "#,
        )
        .map_err(|e| FerryError::Database {
            message: format!("Failed to initialize cache schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FerryError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    /// Encoded form of a cache key used as the primary key.
    pub fn encode_key(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

/// Fixed-width UTC timestamps, so stored values order correctly as text.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl PersistentStore for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let digest = Self::encode_key(key);

        let row: Option<(Vec<u8>, Option<String>)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key_digest = ?1",
                params![digest],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| FerryError::Database {
                message: format!("Failed to query cache entry: {}", e),
                source: Some(e),
            })?;

        let (value, expires_str) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        // An unparsable expiry is treated as already expired.
        let expires_at = match expires_str {
            Some(s) => Some(parse_timestamp(&s).unwrap_or(DateTime::<Utc>::MIN_UTC)),
            None => None,
        };
        let entry = CacheEntry {
            value: Bytes::from(value),
            expires_at,
        };

        if entry.is_expired() {
            conn.execute(
                "DELETE FROM cache_entries WHERE key_digest = ?1",
                params![digest],
            )
            .map_err(|e| FerryError::Database {
                message: format!("Failed to purge expired entry: {}", e),
                source: Some(e),
            })?;
            debug!("Purged expired persistent entry for {}", key);
            return Ok(None);
        }

        Ok(Some(entry))
    }

    fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let conn = self.lock()?;
        let now = format_timestamp(Utc::now());
        let expires = entry.expires_at.map(format_timestamp);

        conn.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries (key_digest, key, value, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                Self::encode_key(key),
                key,
                entry.value.as_ref(),
                now,
                expires
            ],
        )
        .map_err(|e| FerryError::Database {
            message: format!("Failed to set cache entry: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM cache_entries WHERE key_digest = ?1",
                params![Self::encode_key(key)],
            )
            .map_err(|e| FerryError::Database {
                message: format!("Failed to remove cache entry: {}", e),
                source: Some(e),
            })?;
        Ok(deleted > 0)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM cache_entries", [])
            .map_err(|e| FerryError::Database {
                message: format!("Failed to clear cache: {}", e),
                source: Some(e),
            })?;
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        let now = format_timestamp(Utc::now());
        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(|e| FerryError::Database {
                message: format!("Failed to clean up expired entries: {}", e),
                source: Some(e),
            })?;
        if removed > 0 {
            debug!("Removed {} expired cache entries", removed);
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| FerryError::Database {
                message: format!("Failed to count cache entries: {}", e),
                source: Some(e),
            })?;
        Ok(count as usize)
    }
}
