//! WebSocket server: one task per connection, routed by target path.
//!
//! ```text
//! Client A ──┐  ws://host/space/S1
//!            ├── ConnectionGateway ── SessionRegistry ── SessionRecord(space:S1)
//! Client B ──┘                                              │   ├── LiveDocument (yrs)
//!                                                           │   └── BroadcastGroup
//!                                                           ▼
//!                                             FlushWorker ── Binder ── TieredStore
//! ```
//!
//! Per connection:
//! 1. Handshake; the request path is the connection target.
//! 2. Admission; a refusal closes with 1008 (bad target, unknown document) or
//!    1011 (load failure).
//! 3. The server sends `SyncStep1` and the known awareness states, answers
//!    `SyncStep1` with `SyncStep2` and `QueryAwareness` with the awareness
//!    states, applies `SyncStep2`/`Update`/`Awareness` and relays them to the
//!    other sessions.
//! 4. Every `ping_interval` the server pings; a peer that has not answered
//!    the previous ping within `pong_timeout` is dropped.
//! 5. However the loop ends, the session is released.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::binder::Binders;
use crate::error::CollabError;
use crate::gateway::ConnectionGateway;
use crate::protocol::{self, Frame, SyncMessage};
use crate::registry::{RegistryConfig, SessionGuard, SessionRecord, SessionRegistry};
use crate::scheduler;
use crate::storage::{CacheConfig, DocumentStore, MemoryCache, Repositories, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory for the durable tier
    pub storage_path: PathBuf,
    pub cache: CacheConfig,
    pub registry: RegistryConfig,
    /// Keepalive ping period per connection (default: 30s)
    pub ping_interval: Duration,
    /// How long an unanswered ping may stay outstanding (default: 30s)
    pub pong_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9001".to_string(),
            storage_path: PathBuf::from("octo_data"),
            cache: CacheConfig::default(),
            registry: RegistryConfig::default(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            storage_path: PathBuf::from("octo_test_data"),
            cache: CacheConfig::for_testing(),
            registry: RegistryConfig::for_testing(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(30),
        }
    }

    /// Defaults overridden by `OCTO_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `OCTO_*` keys.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("OCTO_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("OCTO_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OCTO_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "OCTO_FLUSH_DEBOUNCE_MS") {
            config.registry.flush.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OCTO_SWEEP_INTERVAL_SECS") {
            config.registry.flush.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OCTO_PING_INTERVAL_SECS") {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OCTO_PONG_TIMEOUT_SECS") {
            config.pong_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    /// Connections dropped for not answering a ping.
    pub liveness_timeouts: u64,
}

/// Keepalive timing for one connection.
#[derive(Debug, Clone, Copy)]
struct Liveness {
    ping_interval: Duration,
    pong_timeout: Duration,
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<ConnectionGateway>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<DocumentStore>>,
    cache: Option<Arc<MemoryCache>>,
}

impl SyncServer {
    /// Server over an already assembled gateway.
    pub fn new(config: ServerConfig, gateway: Arc<ConnectionGateway>) -> Self {
        Self {
            config,
            gateway,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: None,
            cache: None,
        }
    }

    /// Open RocksDB at `config.storage_path` and assemble the full stack over
    /// it with an in-process cache tier.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(DocumentStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?);
        let cache = Arc::new(MemoryCache::new());
        let repositories = Repositories::new(Arc::new(store.spaces()), Arc::new(store.notes()));
        let binders = Binders::tiered(cache.clone(), &repositories, &config.cache);
        let registry = SessionRegistry::new(binders, config.registry.clone());
        let gateway = Arc::new(ConnectionGateway::new(registry, repositories));

        let mut server = Self::new(config, gateway);
        server.store = Some(store);
        server.cache = Some(cache);
        Ok(server)
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        info!("sync server listening on {}", listener.local_addr()?);

        let registry = self.gateway.registry();
        let sweeper = scheduler::spawn_sweeper(registry, registry.config().flush.sweep_interval);
        let purger = self.cache.clone().map(|cache| {
            let every = self.config.cache.ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    ticker.tick().await;
                    let purged = cache.purge_expired().await;
                    if purged > 0 {
                        debug!("purged {purged} expired cache entries");
                    }
                }
            })
        });

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            debug!("new TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();
            let liveness = Liveness {
                ping_interval: self.config.ping_interval.max(Duration::from_millis(1)),
                pong_timeout: self.config.pong_timeout,
            };
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway, stats, liveness).await {
                    warn!("connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        if let Some(purger) = purger {
            purger.abort();
        }
        result
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<ConnectionGateway>,
        stats: Arc<RwLock<ServerStats>>,
        liveness: Liveness,
    ) -> Result<(), BoxError> {
        let mut target = String::new();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            target = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            Ok::<_, ErrorResponse>(response)
        })
        .await?;
        stats.write().await.total_connections += 1;

        let guard = match gateway.admit(&target).await {
            Ok(guard) => guard,
            Err(e) => {
                info!("refused {addr} for {target:?}: {e}");
                stats.write().await.rejected_connections += 1;
                let frame = CloseFrame {
                    code: e.close_code(),
                    reason: e.reason().into(),
                };
                ws.close(Some(frame)).await?;
                return Ok(());
            }
        };

        stats.write().await.active_connections += 1;
        let result = Self::run_session(&guard, ws, &stats, liveness).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        info!("session {} on {} ended", guard.session_id(), guard.identity());
        guard.release().await;
        result
    }

    async fn run_session(
        guard: &SessionGuard,
        ws: WebSocketStream<TcpStream>,
        stats: &RwLock<ServerStats>,
        liveness: Liveness,
    ) -> Result<(), BoxError> {
        let record = guard.record();
        let session_id = guard.session_id();
        let mut broadcast_rx = guard.subscribe().await;
        let (mut sink, mut stream) = ws.split();

        let state_vector = record.document().state_vector().await;
        sink.send(Message::Binary(protocol::sync_step1(state_vector).into()))
            .await?;
        let known = record.awareness_state()?;
        if !known.clients.is_empty() {
            sink.send(Message::Binary(protocol::awareness(known).into())).await?;
        }

        let mut keepalive =
            tokio::time::interval_at(Instant::now() + liveness.ping_interval, liveness.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.frames_received += 1;
                            s.bytes_received += data.len() as u64;
                        }
                        match Self::on_frame(record, session_id, &data).await {
                            Ok(Some(reply)) => sink.send(Message::Binary(reply.into())).await?,
                            Ok(None) => {}
                            Err(e) => warn!("dropping frame from session {session_id} on {}: {e}", record.identity()),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Pong(_))) => ping_sent_at = None,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("transport error on session {session_id}: {e}");
                        break;
                    }
                },

                outgoing = broadcast_rx.recv() => match outgoing {
                    Ok(envelope) if envelope.is_from(session_id) => {}
                    Ok(envelope) => sink.send(Message::Binary(envelope.frame.to_vec().into())).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        record.broadcast().record_lag(skipped);
                        warn!("session {session_id} lagged by {skipped} frames, resending full state");
                        let full = record.document().full_state().await;
                        sink.send(Message::Binary(protocol::update(full).into())).await?;
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = keepalive.tick() => match ping_sent_at {
                    Some(sent) if sent.elapsed() >= liveness.pong_timeout => {
                        warn!(
                            "session {session_id} on {} missed a pong for {:?}, dropping",
                            record.identity(),
                            sent.elapsed()
                        );
                        stats.write().await.liveness_timeouts += 1;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        sink.send(Message::Ping(Vec::new().into())).await?;
                        ping_sent_at = Some(Instant::now());
                    }
                },
            }
        }
        Ok(())
    }

    /// Handle one client frame, returning the direct reply if any.
    async fn on_frame(record: &SessionRecord, session_id: Uuid, data: &[u8]) -> Result<Option<Vec<u8>>, CollabError> {
        match protocol::decode(data)? {
            Frame::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = record.document().diff(&state_vector).await;
                Ok(Some(protocol::sync_step2(diff)))
            }
            Frame::Sync(SyncMessage::SyncStep2(update)) | Frame::Sync(SyncMessage::Update(update)) => {
                record.apply_update(session_id, &update).await?;
                Ok(None)
            }
            Frame::Awareness(update) => {
                record.apply_awareness(session_id, update).await?;
                Ok(None)
            }
            Frame::AwarenessQuery => Ok(Some(protocol::awareness(record.awareness_state()?))),
            Frame::Auth(_) | Frame::Custom(..) => Ok(None),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    /// The RocksDB store, when opened with [`SyncServer::open`].
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9001");
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("OCTO_BIND_ADDR", "0.0.0.0:7000"),
            ("OCTO_STORAGE_PATH", "/var/lib/octo"),
            ("OCTO_CACHE_TTL_SECS", "120"),
            ("OCTO_FLUSH_DEBOUNCE_MS", "750"),
            ("OCTO_SWEEP_INTERVAL_SECS", "not-a-number"),
            ("OCTO_PING_INTERVAL_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, PathBuf::from("/var/lib/octo"));
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert_eq!(config.registry.flush.debounce, Duration::from_millis(750));
        assert_eq!(
            config.registry.flush.sweep_interval,
            RegistryConfig::default().flush.sweep_interval
        );
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_open_assembles_rocks_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: dir.path().to_path_buf(),
            ..ServerConfig::for_testing("127.0.0.1:0")
        };
        let server = SyncServer::open(config).unwrap();
        assert!(server.store().is_some());
        assert_eq!(server.gateway().registry().live_count().await, 0);
        assert_eq!(server.stats().await.total_connections, 0);
    }
}
