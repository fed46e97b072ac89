//! Admission of incoming connections.

use std::sync::Arc;

use log::{info, warn};

use crate::error::{CollabError, GatewayError};
use crate::identity::DocumentIdentity;
use crate::registry::{SessionGuard, SessionRegistry};
use crate::storage::Repositories;

/// Validates connection targets and attaches sessions to live records.
pub struct ConnectionGateway {
    registry: Arc<SessionRegistry>,
    repositories: Repositories,
}

impl ConnectionGateway {
    pub fn new(registry: Arc<SessionRegistry>, repositories: Repositories) -> Self {
        Self {
            registry,
            repositories,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parse the target, check the document exists, then attach.
    ///
    /// A rejected target or a missing document never creates a registry
    /// entry. Release the returned guard when the connection ends.
    pub async fn admit(&self, raw_target: &str) -> Result<SessionGuard, GatewayError> {
        let identity = DocumentIdentity::parse_target(raw_target).inspect_err(|_| {
            warn!("rejected connection target {raw_target:?}");
        })?;

        let exists = self
            .repositories
            .exists(&identity)
            .await
            .map_err(CollabError::from)?;
        if !exists {
            warn!("rejected connection to missing document {identity}");
            return Err(GatewayError::NotFound(identity));
        }

        let guard = self.registry.get_or_create(&identity).await?;
        info!("session {} attached to {identity}", guard.session_id());
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::Binders;
    use crate::codec::{GraphCodec, GraphDocument, GraphNode, GraphPayload, LogPayload, NodeType};
    use crate::registry::RegistryConfig;
    use crate::storage::{CacheConfig, DurableRecord, MemoryCache, MemoryRepository};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    struct Fixture {
        spaces: Arc<MemoryRepository<GraphPayload>>,
        notes: Arc<MemoryRepository<LogPayload>>,
        gateway: ConnectionGateway,
    }

    fn fixture() -> Fixture {
        let spaces = Arc::new(MemoryRepository::<GraphPayload>::new());
        let notes = Arc::new(MemoryRepository::<LogPayload>::new());
        let repositories = Repositories::new(spaces.clone(), notes.clone());
        let binders = Binders::tiered(
            Arc::new(MemoryCache::new()),
            &repositories,
            &CacheConfig::for_testing(),
        );
        let registry = SessionRegistry::new(binders, RegistryConfig::for_testing());
        Fixture {
            spaces,
            notes,
            gateway: ConnectionGateway::new(registry, repositories),
        }
    }

    #[tokio::test]
    async fn test_invalid_target_is_policy_violation() {
        let f = fixture();
        let err = f.gateway.admit("/board/B1").await.err().unwrap();
        assert!(matches!(err, GatewayError::InvalidTarget(_)));
        assert_eq!(err.close_code(), CloseCode::Policy);
        assert_eq!(f.gateway.registry().live_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_document_never_reaches_registry() {
        let f = fixture();
        let err = f.gateway.admit("/note/T404").await.err().unwrap();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(err.reason(), crate::error::reasons::NOTE_NOT_FOUND);
        assert_eq!(f.gateway.registry().live_count().await, 0);
    }

    #[tokio::test]
    async fn test_admit_existing_note() {
        let f = fixture();
        f.notes.insert(DurableRecord::new("T1", "journal", None)).await;

        let guard = f.gateway.admit("/note/T1").await.unwrap();
        assert_eq!(guard.identity(), &DocumentIdentity::log("T1"));
        assert_eq!(f.gateway.registry().session_count(guard.identity()).await, 1);
        guard.release().await;
        assert_eq!(f.gateway.registry().live_count().await, 0);
    }

    #[tokio::test]
    async fn test_existing_space_without_head_is_internal_error() {
        let f = fixture();
        f.spaces.insert(DurableRecord::new("S1", "blank", None)).await;

        let err = f.gateway.admit("/space/S1").await.err().unwrap();
        assert!(matches!(err, GatewayError::Internal(CollabError::MissingHead(_))));
        assert_eq!(err.close_code(), CloseCode::Error);
    }

    #[tokio::test]
    async fn test_store_outage_is_internal_error() {
        let f = fixture();
        let head = GraphDocument::with_head(GraphNode::new("H", NodeType::Head, "s"));
        f.spaces
            .insert(DurableRecord::new("S1", "s", Some(GraphCodec::encode(&head).unwrap())))
            .await;
        f.spaces.set_unavailable(true);

        let err = f.gateway.admit("/space/S1").await.err().unwrap();
        assert!(matches!(err, GatewayError::Internal(CollabError::StoreUnavailable(_))));
    }
}
