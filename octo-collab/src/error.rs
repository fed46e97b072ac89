//! Error taxonomy for the session and persistence layer.
//!
//! Connection-level failures are [`GatewayError`]s and close the socket with a
//! specific status and a fixed reason. Everything below the gateway reports
//! [`CollabError`].

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::codec::CodecError;
use crate::identity::{DocumentIdentity, DocumentKind};
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Fixed close reasons sent to clients.
pub mod reasons {
    pub const INVALID_TARGET: &str = "invalid connection target";
    pub const SPACE_NOT_FOUND: &str = "space not found";
    pub const NOTE_NOT_FOUND: &str = "note not found";
    pub const LOAD_FAILED: &str = "document could not be loaded";
}

/// Errors raised below the gateway.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("document {0} not found")]
    NotFound(DocumentIdentity),

    /// Stored payload failed codec validation.
    #[error("decode error for {identity}: {source}")]
    Decode {
        identity: DocumentIdentity,
        #[source]
        source: CodecError,
    },

    /// Graph document without persisted content, so without a head node.
    #[error("graph document {0} has no head node")]
    MissingHead(DocumentIdentity),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("binding {0} timed out")]
    BindTimeout(DocumentIdentity),

    /// A concurrent bind of the same identity failed while this one waited.
    #[error("binding {identity} failed: {reason}")]
    BindFailed { identity: DocumentIdentity, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    pub fn decode(identity: &DocumentIdentity, source: CodecError) -> Self {
        CollabError::Decode {
            identity: identity.clone(),
            source,
        }
    }
}

/// Reasons a connection is refused at the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid connection target {0:?}")]
    InvalidTarget(String),

    #[error("document {0} does not exist")]
    NotFound(DocumentIdentity),

    /// Existence check or hydration failed.
    #[error(transparent)]
    Internal(#[from] CollabError),
}

impl GatewayError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            GatewayError::InvalidTarget(_) | GatewayError::NotFound(_) => CloseCode::Policy,
            GatewayError::Internal(_) => CloseCode::Error,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::InvalidTarget(_) => reasons::INVALID_TARGET,
            GatewayError::NotFound(identity) => match identity.kind {
                DocumentKind::Graph => reasons::SPACE_NOT_FOUND,
                DocumentKind::Log => reasons::NOTE_NOT_FOUND,
            },
            GatewayError::Internal(_) => reasons::LOAD_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violations() {
        let invalid = GatewayError::InvalidTarget("/x".into());
        assert_eq!(invalid.close_code(), CloseCode::Policy);
        assert_eq!(invalid.reason(), reasons::INVALID_TARGET);

        let missing = GatewayError::NotFound(DocumentIdentity::log("T9"));
        assert_eq!(missing.close_code(), CloseCode::Policy);
        assert_eq!(missing.reason(), reasons::NOTE_NOT_FOUND);
    }

    #[test]
    fn test_internal_errors_use_1011() {
        let err = GatewayError::from(CollabError::BindTimeout(DocumentIdentity::graph("S1")));
        assert_eq!(err.close_code(), CloseCode::Error);
        assert_eq!(u16::from(err.close_code()), 1011);
        assert_eq!(err.reason(), reasons::LOAD_FAILED);
    }
}
