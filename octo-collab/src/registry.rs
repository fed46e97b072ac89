//! Exactly one live replica per document identity.
//!
//! ```text
//! SessionRegistry
//!   └── slots: Mutex<HashMap<DocumentIdentity, Arc<Slot>>>   (held briefly)
//!         └── Slot: Mutex<SlotState>                          (held across bind/teardown)
//!               ├── live: SessionRecord + FlushWorker
//!               ├── sessions: attached connection count
//!               ├── retired: slot is dead, look up again
//!               └── failed: bind error handed to queued waiters
//! ```
//!
//! Creation and teardown for one identity are serialized by its slot mutex,
//! so racing first connects produce a single `bind`, and a connect arriving
//! during teardown waits for the final flush and then hydrates afresh. When a
//! bind fails, connects already queued on that slot fail with it instead of
//! binding again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;
use yrs::block::ClientID;
use yrs::sync::Awareness;

use crate::binder::Binders;
use crate::broadcast::{BroadcastGroup, Envelope};
use crate::codec::log::EMPTY_UPDATE;
use crate::document::LiveDocument;
use crate::error::CollabError;
use crate::identity::DocumentIdentity;
use crate::protocol::{self, AwarenessUpdate, ProtocolError};
use crate::scheduler::{self, FlushPolicy, FlushWorker};
use crate::storage::Durability;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on hydrating a new record (default: 10s)
    pub bind_timeout: Duration,
    /// Frames buffered per attached session (default: 256)
    pub broadcast_capacity: usize,
    pub flush: FlushPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_timeout: Duration::from_secs(10),
            broadcast_capacity: 256,
            flush: FlushPolicy::default(),
        }
    }
}

impl RegistryConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_timeout: Duration::from_secs(2),
            broadcast_capacity: 64,
            flush: FlushPolicy::for_testing(),
        }
    }
}

/// Live state for one identity, shared by all of its sessions.
pub struct SessionRecord {
    identity: DocumentIdentity,
    document: LiveDocument,
    broadcast: BroadcastGroup,
    awareness: Awareness,
    /// Awareness client ids announced by each attached session.
    presence: Mutex<HashMap<Uuid, HashSet<ClientID>>>,
    /// Bumped on every applied mutation.
    revision: AtomicU64,
    /// Highest revision known to be in the durable tier.
    durable_revision: AtomicU64,
    /// Highest revision written to at least the cache.
    cached_revision: AtomicU64,
    retired: AtomicBool,
    pub(crate) changed: Notify,
    pub(crate) flush_lock: Mutex<()>,
}

impl SessionRecord {
    pub fn new(identity: DocumentIdentity, broadcast_capacity: usize) -> Self {
        Self {
            identity,
            document: LiveDocument::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: Awareness::default(),
            presence: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            durable_revision: AtomicU64::new(0),
            cached_revision: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            changed: Notify::new(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    pub fn document(&self) -> &LiveDocument {
        &self.document
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Merge a client update, wake the flush worker and fan the update out
    /// to the other sessions.
    pub async fn apply_update(&self, origin: Uuid, update: &[u8]) -> Result<(), CollabError> {
        if update == EMPTY_UPDATE {
            return Ok(());
        }
        self.document.apply_update(update).await?;
        self.mark_mutated();
        self.broadcast.publish(origin, protocol::update(update.to_vec()));
        Ok(())
    }

    /// Merge a session's awareness update and relay it to the other
    /// sessions if it changed anything.
    pub async fn apply_awareness(&self, origin: Uuid, update: AwarenessUpdate) -> Result<(), CollabError> {
        let summary = self
            .awareness
            .apply_update_summary(update.clone())
            .map_err(ProtocolError::from)?;
        let Some(summary) = summary else {
            return Ok(());
        };
        {
            let mut presence = self.presence.lock().await;
            let announced = presence.entry(origin).or_default();
            announced.extend(summary.added.iter().chain(&summary.updated));
            for id in &summary.removed {
                announced.remove(id);
            }
        }
        self.broadcast.publish(origin, protocol::awareness(update));
        Ok(())
    }

    /// Every client state currently announced on this record.
    pub fn awareness_state(&self) -> Result<AwarenessUpdate, CollabError> {
        Ok(self.awareness.update().map_err(ProtocolError::from)?)
    }

    /// Clear the awareness states `session_id` announced and broadcast their
    /// removal.
    pub async fn forget_session(&self, session_id: &Uuid) {
        let announced = self.presence.lock().await.remove(session_id);
        let Some(announced) = announced.filter(|ids| !ids.is_empty()) else {
            return;
        };
        for id in &announced {
            self.awareness.remove_state(*id);
        }
        match self.awareness.update_with_clients(announced) {
            Ok(removal) => {
                self.broadcast.publish(*session_id, protocol::awareness(removal));
            }
            Err(e) => warn!("awareness removal for session {session_id} on {}: {e}", self.identity),
        }
    }

    /// Record a mutation made directly on the document.
    pub fn mark_mutated(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_one();
    }

    pub(crate) fn mark_flushed(&self, revision: u64, durability: Durability) {
        self.cached_revision.fetch_max(revision, Ordering::SeqCst);
        if durability == Durability::Durable {
            self.durable_revision.fetch_max(revision, Ordering::SeqCst);
        }
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn durable_revision(&self) -> u64 {
        self.durable_revision.load(Ordering::SeqCst)
    }

    pub fn cached_revision(&self) -> u64 {
        self.cached_revision.load(Ordering::SeqCst)
    }

    /// Mutations exist that the durable tier has not seen.
    pub fn is_dirty(&self) -> bool {
        self.revision() > self.durable_revision()
    }
}

struct LiveRecord {
    record: Arc<SessionRecord>,
    worker: FlushWorker,
}

#[derive(Default)]
struct SlotState {
    live: Option<LiveRecord>,
    sessions: usize,
    retired: bool,
    failed: Option<String>,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

/// Owner of every live [`SessionRecord`].
pub struct SessionRegistry {
    slots: Mutex<HashMap<DocumentIdentity, Arc<Slot>>>,
    binders: Binders,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(binders: Binders, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            binders,
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Attach a session to the live record for `identity`, hydrating it
    /// first if no record exists.
    pub async fn get_or_create(self: &Arc<Self>, identity: &DocumentIdentity) -> Result<SessionGuard, CollabError> {
        loop {
            let slot = self.slot(identity).await;
            let mut state = slot.state.lock().await;
            if let Some(reason) = &state.failed {
                return Err(CollabError::BindFailed {
                    identity: identity.clone(),
                    reason: reason.clone(),
                });
            }
            if state.retired {
                continue;
            }

            let existing = state.live.as_ref().map(|live| live.record.clone());
            let record = match existing {
                Some(record) => record,
                None => match self.hydrate(identity).await {
                    Ok(live) => {
                        let record = live.record.clone();
                        state.live = Some(live);
                        record
                    }
                    Err(e) => {
                        state.failed = Some(e.to_string());
                        state.retired = true;
                        self.remove_slot(identity, &slot).await;
                        return Err(e);
                    }
                },
            };
            state.sessions += 1;
            debug!("{identity}: {} session(s) attached", state.sessions);

            return Ok(SessionGuard {
                registry: Arc::clone(self),
                record,
                session_id: Uuid::new_v4(),
                released: false,
            });
        }
    }

    /// Detach one session. The last detach stops the flush worker, performs
    /// the final durable flush and discards the record.
    pub async fn release(&self, identity: &DocumentIdentity) {
        let slot = self.slots.lock().await.get(identity).cloned();
        let Some(slot) = slot else {
            warn!("release of {identity} with no live record");
            return;
        };

        let mut state = slot.state.lock().await;
        if state.retired || state.sessions == 0 {
            warn!("release of {identity} with no attached session");
            return;
        }
        state.sessions -= 1;
        if state.sessions > 0 {
            debug!("{identity}: {} session(s) remain", state.sessions);
            return;
        }

        if let Some(live) = state.live.take() {
            live.worker.stop().await;
            let binder = self.binders.for_kind(identity.kind);
            scheduler::flush_final(&live.record, binder.as_ref(), &self.config.flush).await;
            let relayed = live.record.broadcast().stats().await;
            info!(
                "{identity}: last session left, record discarded ({} frames relayed, {} lagged)",
                relayed.frames_sent, relayed.frames_lagged
            );
        }
        state.retired = true;
        self.remove_slot(identity, &slot).await;
    }

    /// Durably flush every dirty record. Records busy binding or tearing
    /// down are skipped. Returns how many were flushed.
    pub async fn sweep(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut flushed = 0;
        for slot in slots {
            let record = match slot.state.try_lock() {
                Ok(state) => state.live.as_ref().map(|live| live.record.clone()),
                Err(_) => None,
            };
            let Some(record) = record.filter(|r| r.is_dirty()) else {
                continue;
            };
            let binder = self.binders.for_kind(record.identity().kind);
            match scheduler::flush(&record, binder.as_ref(), Durability::Durable).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => warn!("sweep flush of {} failed: {e}", record.identity()),
            }
        }
        flushed
    }

    /// Number of identities with a live record.
    pub async fn live_count(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.state.lock().await.live.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn session_count(&self, identity: &DocumentIdentity) -> usize {
        let slot = self.slots.lock().await.get(identity).cloned();
        match slot {
            Some(slot) => slot.state.lock().await.sessions,
            None => 0,
        }
    }

    pub async fn record(&self, identity: &DocumentIdentity) -> Option<Arc<SessionRecord>> {
        let slot = self.slots.lock().await.get(identity).cloned()?;
        let state = slot.state.lock().await;
        state.live.as_ref().map(|live| live.record.clone())
    }

    async fn slot(&self, identity: &DocumentIdentity) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone()
    }

    /// Remove `slot` from the map if it is still the registered one.
    async fn remove_slot(&self, identity: &DocumentIdentity, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().await;
        if slots.get(identity).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(identity);
        }
    }

    async fn hydrate(&self, identity: &DocumentIdentity) -> Result<LiveRecord, CollabError> {
        let record = Arc::new(SessionRecord::new(
            identity.clone(),
            self.config.broadcast_capacity,
        ));
        let binder = self.binders.for_kind(identity.kind).clone();
        match tokio::time::timeout(self.config.bind_timeout, binder.bind(&identity.id, record.document())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("bind of {identity} failed: {e}");
                return Err(e);
            }
            Err(_) => {
                warn!("bind of {identity} timed out after {:?}", self.config.bind_timeout);
                return Err(CollabError::BindTimeout(identity.clone()));
            }
        }
        let worker = FlushWorker::spawn(record.clone(), binder, self.config.flush.clone());
        info!("{identity}: record created");
        Ok(LiveRecord { record, worker })
    }
}

/// One attached session. Release it with [`SessionGuard::release`]; a guard
/// dropped unreleased schedules the release on the current runtime.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    record: Arc<SessionRecord>,
    session_id: Uuid,
    released: bool,
}

impl SessionGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity(&self) -> &DocumentIdentity {
        self.record.identity()
    }

    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }

    /// Join the record's broadcast group.
    pub async fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.record.broadcast().join(self.session_id).await
    }

    pub async fn release(mut self) {
        self.released = true;
        self.record.forget_session(&self.session_id).await;
        self.record.broadcast().leave(&self.session_id).await;
        self.registry.release(self.record.identity()).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let record = Arc::clone(&self.record);
        let session_id = self.session_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("session {session_id} on {} dropped without release", record.identity());
                handle.spawn(async move {
                    record.forget_session(&session_id).await;
                    record.broadcast().leave(&session_id).await;
                    registry.release(record.identity()).await;
                });
            }
            Err(_) => error!(
                "session {session_id} on {} dropped outside a runtime, session count leaked",
                record.identity()
            ),
        }
    }
}
