//! The in-memory CRDT replica of one document.

use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::ProtocolError;

/// Live yrs document shared by every session attached to one identity.
///
/// Lock guards are held only for synchronous transaction scopes, never across
/// an `.await`.
pub struct LiveDocument {
    doc: RwLock<Doc>,
}

impl Default for LiveDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveDocument {
    pub fn new() -> Self {
        Self {
            doc: RwLock::new(Doc::new()),
        }
    }

    /// Run `f` against the document under a shared lock.
    pub async fn read<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let doc = self.doc.read().await;
        f(&doc)
    }

    /// Run `f` against the document under an exclusive lock.
    pub async fn write<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let doc = self.doc.write().await;
        f(&doc)
    }

    pub async fn state_vector(&self) -> StateVector {
        self.read(|doc| doc.transact().state_vector()).await
    }

    /// Everything the holder of `state_vector` is missing, as a v1 update.
    pub async fn diff(&self, state_vector: &StateVector) -> Vec<u8> {
        self.read(|doc| doc.transact().encode_diff_v1(state_vector)).await
    }

    /// Full state as a v1 update.
    pub async fn full_state(&self) -> Vec<u8> {
        self.read(|doc| doc.transact().encode_state_as_update_v1(&StateVector::default()))
            .await
    }

    /// Merge a remote v1 update.
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), ProtocolError> {
        let update =
            Update::decode_v1(update).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        self.write(|doc| {
            doc.transact_mut()
                .apply_update(update)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
        })
        .await
    }
}
