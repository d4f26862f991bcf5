//! Cache key derivation and tier expiry.

use bytes::Bytes;
use ferrylink::cache::{CacheConfig, PersistentStore};
use ferrylink::{CacheStore, Request, SqliteCache};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_cache_key_ignores_query_order_and_headers() {
    let a = Request::get("/search")
        .with_query("q", "rust")
        .with_query("page", "2")
        .with_header("Authorization", "Bearer one");
    let b = Request::get("/search")
        .with_query("page", "2")
        .with_query("q", "rust")
        .with_header("Authorization", "Bearer two");

    assert_eq!(a.cache_key(), "GET:/search?page=2&q=rust");
    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), Request::post("/search").cache_key());
}

#[tokio::test]
async fn test_entries_expire_in_both_tiers() {
    let tmp = TempDir::new().unwrap();
    let sqlite = Arc::new(SqliteCache::new(tmp.path().join("cache.db")).unwrap());
    let store = CacheStore::with_persistent(&CacheConfig::default(), sqlite.clone());

    store.set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(100)));
    assert_eq!(store.get("k").as_deref(), Some(&b"v"[..]));
    assert!(sqlite.get("k").unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.get("k").is_none());
    assert!(!store.contains_memory("k"));
    assert!(sqlite.get("k").unwrap().is_none());
}

#[test]
fn test_memory_only_write_skips_persistent_tier() {
    let sqlite = Arc::new(SqliteCache::in_memory().unwrap());
    let store = CacheStore::with_persistent(&CacheConfig::default(), sqlite.clone());

    store.set("transient", Bytes::from_static(b"x"), None);
    assert!(store.contains_memory("transient"));
    assert!(sqlite.is_empty().unwrap());

    store.invalidate("transient").unwrap();
    assert!(store.get("transient").is_none());
}

#[test]
fn test_persistent_hit_is_promoted() {
    let sqlite = Arc::new(SqliteCache::in_memory().unwrap());
    let writer = CacheStore::with_persistent(&CacheConfig::default(), sqlite.clone());
    writer.set("k", Bytes::from_static(b"durable"), Some(Duration::from_secs(60)));

    let reader = CacheStore::with_persistent(&CacheConfig::default(), sqlite);
    assert!(!reader.contains_memory("k"));
    assert_eq!(reader.get("k").as_deref(), Some(&b"durable"[..]));
    assert!(reader.contains_memory("k"));
}
