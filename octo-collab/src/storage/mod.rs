//! Two-tier document storage.
//!
//! ```text
//! ┌──────────────┐  get: cache → durable → repopulate  ┌──────────────────┐
//! │  Binder      │ ──────────────────────────────────► │  TieredStore<P>  │
//! └──────────────┘  set: cache always, durable on flag └────────┬─────────┘
//!                                                               │
//!                          ┌────────────────────────────────────┼──────────────┐
//!                          ▼                                    ▼              │
//!                 ┌─────────────────┐                 ┌──────────────────┐     │
//!                 │ CacheTier       │                 │ DocumentRepository│    │
//!                 │ (MemoryCache,   │                 │ (RocksRepository, │    │
//!                 │  TTL, ephemeral)│                 │  MemoryRepository)│    │
//!                 └─────────────────┘                 └──────────────────┘     │
//! ```
//!
//! The cache may be stale or empty at any time; the durable tier is
//! authoritative.

pub mod cache;
pub mod repository;
pub mod rocks;
pub mod tiered;

pub use cache::{CacheConfig, CacheTier, MemoryCache};
pub use repository::{DocumentRepository, DurableRecord, MemoryRepository, Repositories};
pub use rocks::{DocumentStore, RocksRepository, StoreConfig};
pub use tiered::{Durability, TieredStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::identity::DocumentKind;

/// Content type persisted for one document kind.
pub trait StoredPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: DocumentKind;
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// Tier unreachable (connection refused, injected outage).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
