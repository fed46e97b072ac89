//! Durable tier: the document rows owned by the CRUD collaborator.
//!
//! This layer only reads rows and rewrites their `content`; creating and
//! deleting documents happens elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{unix_now, StoreError, StoredPayload};
use crate::codec::{GraphPayload, LogPayload};
use crate::identity::{DocumentIdentity, DocumentKind};

/// Authoritative stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord<P> {
    pub id: String,
    pub name: String,
    /// `None` until the first flush (notes) or document birth (spaces).
    pub content: Option<P>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl<P> DurableRecord<P> {
    pub fn new(id: impl Into<String>, name: impl Into<String>, content: Option<P>) -> Self {
        let now = unix_now();
        Self {
            id: id.into(),
            name: name.into(),
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable store interface for one payload type.
#[async_trait]
pub trait DocumentRepository<P: StoredPayload>: Send + Sync {
    async fn exists_by_id(&self, id: &str) -> Result<bool, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<DurableRecord<P>>, StoreError>;

    /// Replace the content of an existing row. Missing rows are
    /// [`StoreError::NotFound`]; rows are never created here.
    async fn update_content(&self, id: &str, content: &P) -> Result<(), StoreError>;
}

/// In-process durable tier with fault injection, for tests and embedding.
pub struct MemoryRepository<P> {
    rows: RwLock<HashMap<String, DurableRecord<P>>>,
    writes: AtomicU64,
    unavailable: AtomicBool,
    failing_writes: AtomicU32,
}

impl<P: StoredPayload> Default for MemoryRepository<P> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            failing_writes: AtomicU32::new(0),
        }
    }
}

impl<P: StoredPayload> MemoryRepository<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DurableRecord<P>) {
        self.rows.write().await.insert(record.id.clone(), record);
    }

    /// Successful `update_content` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` content updates with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("durable tier offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: StoredPayload> DocumentRepository<P> for MemoryRepository<P> {
    async fn exists_by_id(&self, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.rows.read().await.contains_key(id))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DurableRecord<P>>, StoreError> {
        self.check_available()?;
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn update_content(&self, id: &str, content: &P) -> Result<(), StoreError> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("{}:{id}", P::KIND)))?;
        row.content = Some(content.clone());
        row.updated_at = unix_now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Durable repositories for both document kinds.
#[derive(Clone)]
pub struct Repositories {
    pub spaces: Arc<dyn DocumentRepository<GraphPayload>>,
    pub notes: Arc<dyn DocumentRepository<LogPayload>>,
}

impl Repositories {
    pub fn new(
        spaces: Arc<dyn DocumentRepository<GraphPayload>>,
        notes: Arc<dyn DocumentRepository<LogPayload>>,
    ) -> Self {
        Self { spaces, notes }
    }

    /// Existence check used by the gateway before admitting a connection.
    pub async fn exists(&self, identity: &DocumentIdentity) -> Result<bool, StoreError> {
        match identity.kind {
            DocumentKind::Graph => self.spaces.exists_by_id(&identity.id).await,
            DocumentKind::Log => self.notes.exists_by_id(&identity.id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str) -> DurableRecord<LogPayload> {
        DurableRecord::new(id, "scratch", None)
    }

    #[tokio::test]
    async fn test_update_existing_row() {
        let repo = MemoryRepository::new();
        repo.insert(note("T1")).await;

        let content = LogPayload { content: "AAA=".into() };
        repo.update_content("T1", &content).await.unwrap();

        let row = repo.find_by_id("T1").await.unwrap().unwrap();
        assert_eq!(row.content, Some(content));
        assert_eq!(repo.write_count(), 1);
    }

    #[tokio::test]
    async fn test_update_never_creates_rows() {
        let repo: MemoryRepository<LogPayload> = MemoryRepository::new();
        let err = repo
            .update_content("ghost", &LogPayload { content: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!repo.exists_by_id("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let repo = MemoryRepository::new();
        repo.insert(note("T1")).await;
        repo.fail_next_writes(2);

        let content = LogPayload { content: String::new() };
        assert!(repo.update_content("T1", &content).await.is_err());
        assert!(repo.update_content("T1", &content).await.is_err());
        assert!(repo.update_content("T1", &content).await.is_ok());
        assert_eq!(repo.write_count(), 1);
    }

    #[tokio::test]
    async fn test_repositories_exists_dispatches_on_kind() {
        let spaces = Arc::new(MemoryRepository::<GraphPayload>::new());
        let notes = Arc::new(MemoryRepository::<LogPayload>::new());
        notes.insert(note("X")).await;
        let repos = Repositories::new(spaces, notes);

        assert!(repos.exists(&DocumentIdentity::log("X")).await.unwrap());
        assert!(!repos.exists(&DocumentIdentity::graph("X")).await.unwrap());
    }
}
