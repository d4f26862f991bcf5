//! Response cache.
//!
//! A bounded memory tier in front of an optional SQLite tier. Keys are the
//! deterministic request cache keys produced by
//! [`Request::cache_key`](crate::request::Request::cache_key).

mod memory;
mod sqlite;
mod store;
mod traits;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;
pub use store::CacheStore;
pub use traits::{CacheConfig, CacheEntry, PersistentStore};
