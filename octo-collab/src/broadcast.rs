//! Fan-out of encoded frames to the sessions attached to one document.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, and each
//! subscriber buffers up to `capacity` frames. Frames carry the originating
//! session id so a session can skip its own echo.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// An encoded frame tagged with the session that produced it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    pub fn is_from(&self, session_id: Uuid) -> bool {
        self.origin == session_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_sessions: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Broadcast group for one live document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    /// Attached session ids.
    sessions: RwLock<HashSet<Uuid>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per session before a slow reader lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: RwLock::new(HashSet::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Attach a session and return its receiver.
    pub async fn join(&self, session_id: Uuid) -> broadcast::Receiver<Envelope> {
        self.sessions.write().await.insert(session_id);
        self.sender.subscribe()
    }

    pub async fn leave(&self, session_id: &Uuid) -> bool {
        self.sessions.write().await.remove(session_id)
    }

    /// Send an encoded frame to every subscriber, the origin included.
    /// Returns the number of receivers reached.
    pub fn publish(&self, origin: Uuid, frame: Vec<u8>) -> usize {
        let envelope = Envelope {
            origin,
            frame: Arc::new(frame),
        };
        let count = self.sender.send(envelope).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a slow receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }
}
