//! Ephemeral cache tier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::StoreError;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry lifetime, refreshed on every write (default: 1 hour).
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn for_testing() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

/// Key/value cache with per-entry expiry. Values are serialized payloads.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: String,
    expires_at: Instant,
}

/// In-process cache tier.
///
/// Expired entries are dropped lazily on read and in bulk by
/// [`MemoryCache::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Overwrite a raw entry without going through a payload encoder.
    pub async fn insert_raw(&self, key: &str, payload: impl Into<String>, ttl: Duration) {
        self.entries.write().await.insert(
            key.to_string(),
            CacheEntry {
                payload: payload.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("cache tier offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.payload.clone()))
                }
                Some(_) => {}
            }
        }
        // Expired: evict unless a writer refreshed it in the meantime.
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        self.insert_raw(key, value, ttl).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("space:S1", "{}".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("space:S1").await.unwrap().as_deref(), Some("{}"));

        cache.delete("space:S1").await.unwrap();
        assert!(cache.get("space:S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_evicted() {
        let cache = MemoryCache::new();
        cache.set("note:T1", "x".into(), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get("note:T1").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("a", "1".into(), Duration::from_millis(5)).await.unwrap();
        cache.set("b", "2".into(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_unavailable(true);
        assert!(matches!(cache.get("a").await, Err(StoreError::Unavailable(_))));
        assert!(cache.set("a", "1".into(), Duration::from_secs(1)).await.is_err());

        cache.set_unavailable(false);
        assert!(cache.get("a").await.unwrap().is_none());
    }
}
