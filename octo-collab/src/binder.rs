//! Hydration and persistence of live documents, one binder per kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use crate::codec::{GraphCodec, GraphPayload, LogCodec, LogPayload};
use crate::document::LiveDocument;
use crate::error::CollabError;
use crate::identity::{DocumentIdentity, DocumentKind};
use crate::storage::{CacheConfig, CacheTier, Durability, Repositories, TieredStore};

/// Moves document content between a live replica and the tiered store.
#[async_trait]
pub trait DocumentBinder: Send + Sync {
    /// Hydrate a fresh, empty replica from storage. Called once per record.
    async fn bind(&self, id: &str, document: &LiveDocument) -> Result<(), CollabError>;

    /// Persist the replica's current merged state. Idempotent.
    async fn write(
        &self,
        id: &str,
        document: &LiveDocument,
        durability: Durability,
    ) -> Result<(), CollabError>;

    /// Durable write that retries transient store failures with linear
    /// backoff. Returns the attempts used.
    async fn write_with_retry(
        &self,
        id: &str,
        document: &LiveDocument,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u32, CollabError>;
}

/// Binder for graph ("space") documents.
pub struct GraphBinder {
    store: TieredStore<GraphPayload>,
}

impl GraphBinder {
    pub fn new(store: TieredStore<GraphPayload>) -> Self {
        Self { store }
    }

    /// Encode the live graph, refusing state that breaks the graph invariants.
    async fn snapshot(&self, id: &str, document: &LiveDocument) -> Result<GraphPayload, CollabError> {
        let identity = DocumentIdentity::graph(id);
        let graph = document
            .read(GraphCodec::extract)
            .await
            .map_err(|e| CollabError::decode(&identity, e))?;
        GraphCodec::encode(&graph).map_err(|e| CollabError::decode(&identity, e))
    }
}

#[async_trait]
impl DocumentBinder for GraphBinder {
    async fn bind(&self, id: &str, document: &LiveDocument) -> Result<(), CollabError> {
        let identity = DocumentIdentity::graph(id);
        let payload = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CollabError::MissingHead(identity.clone()))?;
        let graph = GraphCodec::decode(&payload).map_err(|e| CollabError::decode(&identity, e))?;
        document
            .write(|doc| GraphCodec::apply(doc, &graph))
            .await
            .map_err(|e| CollabError::decode(&identity, e))?;
        info!(
            "hydrated {identity}: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        document: &LiveDocument,
        durability: Durability,
    ) -> Result<(), CollabError> {
        let payload = self.snapshot(id, document).await?;
        self.store.set(id, &payload, durability).await?;
        debug!("wrote space:{id} ({durability:?})");
        Ok(())
    }

    async fn write_with_retry(
        &self,
        id: &str,
        document: &LiveDocument,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u32, CollabError> {
        let payload = self.snapshot(id, document).await?;
        Ok(self
            .store
            .set_durable_with_retry(id, &payload, attempts, backoff)
            .await?)
    }
}

/// Binder for rich-text log ("note") documents.
pub struct LogBinder {
    store: TieredStore<LogPayload>,
}

impl LogBinder {
    pub fn new(store: TieredStore<LogPayload>) -> Self {
        Self { store }
    }

    async fn snapshot(document: &LiveDocument) -> LogPayload {
        LogCodec::encode(&document.read(LogCodec::snapshot).await)
    }
}

#[async_trait]
impl DocumentBinder for LogBinder {
    async fn bind(&self, id: &str, document: &LiveDocument) -> Result<(), CollabError> {
        let identity = DocumentIdentity::log(id);
        let Some(payload) = self.store.get(id).await? else {
            info!("hydrated {identity}: no stored content, starting empty");
            return Ok(());
        };
        let log = LogCodec::decode(&payload).map_err(|e| CollabError::decode(&identity, e))?;
        document
            .write(|doc| LogCodec::apply(doc, &log))
            .await
            .map_err(|e| CollabError::decode(&identity, e))?;
        info!("hydrated {identity}: {} bytes of update log", log.update.len());
        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        document: &LiveDocument,
        durability: Durability,
    ) -> Result<(), CollabError> {
        let payload = Self::snapshot(document).await;
        self.store.set(id, &payload, durability).await?;
        debug!("wrote note:{id} ({durability:?})");
        Ok(())
    }

    async fn write_with_retry(
        &self,
        id: &str,
        document: &LiveDocument,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u32, CollabError> {
        let payload = Self::snapshot(document).await;
        Ok(self
            .store
            .set_durable_with_retry(id, &payload, attempts, backoff)
            .await?)
    }
}

/// One binder per document kind, injected into the registry.
#[derive(Clone)]
pub struct Binders {
    pub graph: Arc<dyn DocumentBinder>,
    pub log: Arc<dyn DocumentBinder>,
}

impl Binders {
    pub fn new(graph: Arc<dyn DocumentBinder>, log: Arc<dyn DocumentBinder>) -> Self {
        Self { graph, log }
    }

    /// Standard binders over a shared cache and the durable repositories.
    pub fn tiered(cache: Arc<dyn CacheTier>, repositories: &Repositories, config: &CacheConfig) -> Self {
        let graph = TieredStore::new(cache.clone(), repositories.spaces.clone(), config);
        let log = TieredStore::new(cache, repositories.notes.clone(), config);
        Self {
            graph: Arc::new(GraphBinder::new(graph)),
            log: Arc::new(LogBinder::new(log)),
        }
    }

    pub fn for_kind(&self, kind: DocumentKind) -> &Arc<dyn DocumentBinder> {
        match kind {
            DocumentKind::Graph => &self.graph,
            DocumentKind::Log => &self.log,
        }
    }
}
