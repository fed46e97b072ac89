//! Conversions between CRDT-native document state and storage payloads.
//!
//! | Kind  | In-memory (yrs)                         | Stored                     |
//! |-------|-----------------------------------------|----------------------------|
//! | Graph | map `context` → maps `edges`, `nodes`   | two JSON strings           |
//! | Log   | full v1 update of the document          | base64 text                |
//!
//! Decoding never coerces: malformed input is a [`CodecError`].

pub mod graph;
pub mod log;

pub use graph::{GraphCodec, GraphDocument, GraphEdge, GraphNode, GraphPayload, NodeType};
pub use log::{LogCodec, LogDocument, LogPayload};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed {field} JSON: {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed {field} entry {key:?}: {source}")]
    Entry {
        field: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not a map")]
    NotAMap(&'static str),

    #[error("node stored under {key:?} has id {id:?}")]
    NodeKeyMismatch { key: String, id: String },

    #[error("graph has no head node")]
    MissingHead,

    #[error("graph has {0} head nodes")]
    MultipleHeads(usize),

    #[error("edge {edge:?} references missing node {node:?}")]
    DanglingEdge { edge: String, node: String },

    #[error("edge {0:?} loops the head node onto itself")]
    HeadSelfLoop(String),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid update: {0}")]
    Update(String),
}
