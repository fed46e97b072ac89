//! Rich-text ("note") documents, stored as one base64 full-state update.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::CodecError;
use crate::identity::DocumentKind;
use crate::storage::StoredPayload;

/// Stored form of a log document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub content: String,
}

impl StoredPayload for LogPayload {
    const KIND: DocumentKind = DocumentKind::Log;
}

/// Full CRDT state of a log document as a v1 update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDocument {
    pub update: Vec<u8>,
}

/// v1 encoding of an update with no structs and no deletions.
pub(crate) const EMPTY_UPDATE: [u8; 2] = [0, 0];

impl LogDocument {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() || self.update == EMPTY_UPDATE
    }
}

pub struct LogCodec;

impl LogCodec {
    pub fn encode(log: &LogDocument) -> LogPayload {
        LogPayload {
            content: STANDARD.encode(&log.update),
        }
    }

    /// Decode stored text. An empty string is an empty document; anything
    /// else must be base64 of a well-formed update.
    pub fn decode(payload: &LogPayload) -> Result<LogDocument, CodecError> {
        if payload.content.is_empty() {
            return Ok(LogDocument::default());
        }
        let update = STANDARD.decode(payload.content.as_bytes())?;
        Update::decode_v1(&update).map_err(|e| CodecError::Update(e.to_string()))?;
        Ok(LogDocument { update })
    }

    /// Snapshot the full state of a live document.
    pub fn snapshot(doc: &Doc) -> LogDocument {
        let txn = doc.transact();
        LogDocument {
            update: txn.encode_state_as_update_v1(&StateVector::default()),
        }
    }

    /// Merge a stored log into a live document.
    pub fn apply(doc: &Doc, log: &LogDocument) -> Result<(), CodecError> {
        if log.is_empty() {
            return Ok(());
        }
        let update = Update::decode_v1(&log.update).map_err(|e| CodecError::Update(e.to_string()))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CodecError::Update(e.to_string()))
    }
}
