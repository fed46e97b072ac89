//! Cache-aside composition of the cache and durable tiers.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use super::cache::{CacheConfig, CacheTier};
use super::repository::DocumentRepository;
use super::{StoreError, StoredPayload};
use crate::identity::DocumentIdentity;

/// Which tiers a write must reach before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Cache only; the durable tier catches up on a later flush.
    CacheOnly,
    /// Cache and durable tier.
    Durable,
}

/// Two-tier store for one payload type.
///
/// Cache failures never fail an operation: they are logged and the durable
/// tier is used alone.
pub struct TieredStore<P: StoredPayload> {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DocumentRepository<P>>,
    ttl: Duration,
}

impl<P: StoredPayload> TieredStore<P> {
    pub fn new(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DocumentRepository<P>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            cache,
            durable,
            ttl: config.ttl,
        }
    }

    fn key(id: &str) -> String {
        DocumentIdentity::new(P::KIND, id).storage_key()
    }

    /// Cache first; on a miss read the durable tier and repopulate the cache.
    ///
    /// `None` means the row has no content yet (or no row exists).
    pub async fn get(&self, id: &str) -> Result<Option<P>, StoreError> {
        let key = Self::key(id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<P>(&raw) {
                Ok(payload) => {
                    debug!("cache hit for {key}");
                    return Ok(Some(payload));
                }
                Err(e) => {
                    warn!("corrupt cache entry for {key}, evicting and reading durable tier: {e}");
                    if let Err(e) = self.cache.delete(&key).await {
                        warn!("could not evict {key}: {e}");
                    }
                }
            },
            Ok(None) => debug!("cache miss for {key}"),
            Err(e) => warn!("cache read failed for {key}, reading durable tier: {e}"),
        }

        let content = self
            .durable
            .find_by_id(id)
            .await?
            .and_then(|record| record.content);
        if let Some(payload) = &content {
            self.populate(&key, payload).await;
        }
        Ok(content)
    }

    /// Write the cache, then the durable tier if `durability` asks for it.
    pub async fn set(&self, id: &str, payload: &P, durability: Durability) -> Result<(), StoreError> {
        self.populate(&Self::key(id), payload).await;
        if durability == Durability::Durable {
            self.durable.update_content(id, payload).await?;
        }
        Ok(())
    }

    /// Durable write with linear backoff between attempts. Returns the number
    /// of attempts used. A missing row is not retried.
    pub async fn set_durable_with_retry(
        &self,
        id: &str,
        payload: &P,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u32, StoreError> {
        self.populate(&Self::key(id), payload).await;

        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.durable.update_content(id, payload).await {
                Ok(()) => return Ok(attempt),
                Err(e @ StoreError::NotFound(_)) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "durable write for {} failed (attempt {attempt}/{attempts}): {e}",
                        Self::key(id)
                    );
                    tokio::time::sleep(backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.durable.exists_by_id(id).await
    }

    async fn populate(&self, key: &str, payload: &P) {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("could not serialize cache entry for {key}: {e}");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, raw, self.ttl).await {
            warn!("cache write failed for {key}, continuing durable-only: {e}");
        }
    }
}
