//! y-websocket wire framing for CRDT synchronization.
//!
//! Frames are `yrs::sync::Message`s in their lib0 v1 encoding:
//! ```text
//! ┌──────────────┬────────────────┬───────────────────────────────┐
//! │ frame type   │ sync step      │ payload                       │
//! ├──────────────┼────────────────┼───────────────────────────────┤
//! │ 0 (sync)     │ 0 step1        │ buf(state vector v1)          │
//! │ 0 (sync)     │ 1 step2        │ buf(update v1)                │
//! │ 0 (sync)     │ 2 update       │ buf(update v1)                │
//! │ 1 awareness  │                │ buf(awareness update)         │
//! │ 2 auth       │                │ reason                        │
//! │ 3 query      │                │                               │
//! └──────────────┴────────────────┴───────────────────────────────┘
//! ```
//!
//! This is the framing stock Yjs clients speak, so browser editors can attach
//! without an adapter.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

pub use yrs::sync::{AwarenessUpdate, Message as Frame, SyncMessage};

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] yrs::encoding::read::Error),
    #[error("invalid CRDT payload: {0}")]
    InvalidPayload(String),
    #[error("awareness: {0}")]
    Awareness(#[from] yrs::sync::awareness::Error),
}

/// Deserialize one frame from wire bytes.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    Ok(Frame::decode_v1(bytes)?)
}

pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Frame::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Frame::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Incremental document update frame.
pub fn update(update: Vec<u8>) -> Vec<u8> {
    Frame::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Frame::Awareness(update).encode_v1()
}
