//! # octo-collab — Collaborative sessions and persistence for CRDT documents
//!
//! Serves yrs documents over WebSocket and binds each live replica to a
//! two-tier store: a TTL cache in front of a durable document table.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws://…/space/{id}   ┌───────────────────┐
//! │ y-websocket │ ◄───────────────────► │ ConnectionGateway │
//! │ client      │   ws://…/note/{id}    └─────────┬─────────┘
//! └─────────────┘                                 │ admit
//!                                                 ▼
//!                                       ┌───────────────────┐
//!                                       │ SessionRegistry   │  one record
//!                                       │  └ SessionRecord  │  per identity
//!                                       │     ├ LiveDocument│
//!                                       │     └ Broadcast   │
//!                                       └─────────┬─────────┘
//!                                   bind / flush  │
//!                                                 ▼
//!                                       ┌───────────────────┐
//!                                       │ DocumentBinder    │  graph | log
//!                                       │  └ TieredStore    │
//!                                       │     ├ CacheTier   │  TTL
//!                                       │     └ Repository  │  RocksDB
//!                                       └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: Document kinds and connection target parsing
//! - [`codec`]: Stored payload formats for graph and log documents
//! - [`storage`]: Cache tier, durable repositories, tiered adapter
//! - [`binder`]: Hydration and write-back of live documents
//! - [`registry`]: Live record ownership and session lifecycle
//! - [`scheduler`]: Debounced, periodic and teardown flushes
//! - [`protocol`]: y-websocket framing over `yrs::sync`
//! - [`gateway`]: Connection admission
//! - [`server`]: WebSocket server

pub mod binder;
pub mod broadcast;
pub mod codec;
pub mod document;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use binder::{Binders, DocumentBinder, GraphBinder, LogBinder};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use codec::{
    CodecError, GraphCodec, GraphDocument, GraphEdge, GraphNode, GraphPayload, LogCodec, LogDocument,
    LogPayload, NodeType,
};
pub use document::LiveDocument;
pub use error::{CollabError, GatewayError};
pub use gateway::ConnectionGateway;
pub use identity::{DocumentIdentity, DocumentKind};
pub use protocol::{Frame, ProtocolError, SyncMessage};
pub use registry::{RegistryConfig, SessionGuard, SessionRecord, SessionRegistry};
pub use scheduler::FlushPolicy;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    CacheConfig, CacheTier, DocumentRepository, DocumentStore, Durability, DurableRecord, MemoryCache,
    MemoryRepository, Repositories, RocksRepository, StoreConfig, StoreError, TieredStore,
};
