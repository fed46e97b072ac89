//! When live documents are written back through the tiers.
//!
//! - Edits: a per-record worker coalesces mutation notifications and flushes
//!   after `debounce` of quiet, or `max_delay` after the first notification.
//! - Sweep: a periodic pass flushes durably whatever is still dirty.
//! - Teardown: a mandatory durable flush with bounded retry, awaited before
//!   the record is discarded.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::binder::DocumentBinder;
use crate::error::CollabError;
use crate::registry::{SessionRecord, SessionRegistry};
use crate::storage::Durability;

/// Flush timing and durability policy.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Quiet period after the last edit before flushing (default: 2s)
    pub debounce: Duration,
    /// Upper bound between the first unflushed edit and its flush (default: 10s)
    pub max_delay: Duration,
    /// Period of the dirty-record sweep (default: 30s)
    pub sweep_interval: Duration,
    /// Tiers reached by the debounced edit flush (default: durable)
    pub edit_durability: Durability,
    /// Durable attempts at teardown (default: 5)
    pub teardown_attempts: u32,
    /// Linear backoff step between teardown attempts (default: 200ms)
    pub teardown_backoff: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            edit_durability: Durability::Durable,
            teardown_attempts: 5,
            teardown_backoff: Duration::from_millis(200),
        }
    }
}

impl FlushPolicy {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(100),
            edit_durability: Durability::Durable,
            teardown_attempts: 3,
            teardown_backoff: Duration::from_millis(5),
        }
    }
}

/// Flush the record's current state. Returns `false` if the record was
/// already retired.
pub async fn flush(
    record: &SessionRecord,
    binder: &dyn DocumentBinder,
    durability: Durability,
) -> Result<bool, CollabError> {
    let _flushing = record.flush_lock.lock().await;
    if record.is_retired() {
        return Ok(false);
    }
    let revision = record.revision();
    binder
        .write(&record.identity().id, record.document(), durability)
        .await?;
    record.mark_flushed(revision, durability);
    Ok(true)
}

/// Teardown flush: durable, retried, and final. After it returns the record
/// accepts no further flushes.
pub async fn flush_final(record: &SessionRecord, binder: &dyn DocumentBinder, policy: &FlushPolicy) -> bool {
    let _flushing = record.flush_lock.lock().await;
    let identity = record.identity();
    let revision = record.revision();
    let result = binder
        .write_with_retry(
            &identity.id,
            record.document(),
            policy.teardown_attempts,
            policy.teardown_backoff,
        )
        .await;
    record.retire();
    match result {
        Ok(attempts) => {
            record.mark_flushed(revision, Durability::Durable);
            info!("final flush of {identity} at revision {revision} ({attempts} attempt(s))");
            true
        }
        Err(e) => {
            error!(
                "durability loss: final flush of {identity} at revision {revision} failed \
                 after {} attempt(s), last persisted revision {}: {e}",
                policy.teardown_attempts,
                record.durable_revision()
            );
            false
        }
    }
}

/// Handle to a record's flush worker task.
pub struct FlushWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    pub fn spawn(record: Arc<SessionRecord>, binder: Arc<dyn DocumentBinder>, policy: FlushPolicy) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(record, binder, policy, rx));
        Self { shutdown, handle }
    }

    /// Stop the worker, waiting for an in-flight flush to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("flush worker ended abnormally: {e}");
        }
    }
}

async fn run_worker(
    record: Arc<SessionRecord>,
    binder: Arc<dyn DocumentBinder>,
    policy: FlushPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = record.changed.notified() => {}
        }

        let hard_deadline = Instant::now() + policy.max_delay;
        let mut quiet_deadline = Instant::now() + policy.debounce;
        loop {
            tokio::select! {
                biased;
                // Teardown performs the final flush itself.
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep_until(quiet_deadline.min(hard_deadline)) => break,
                _ = record.changed.notified() => quiet_deadline = Instant::now() + policy.debounce,
            }
        }

        match flush(&record, binder.as_ref(), policy.edit_durability).await {
            Ok(_) => debug!(
                "flushed {} at revision {} ({:?})",
                record.identity(),
                record.revision(),
                policy.edit_durability
            ),
            Err(e) => warn!("flush of {} failed: {e}", record.identity()),
        }
    }
}

/// Run [`SessionRegistry::sweep`] every `every` until the registry is dropped.
pub fn spawn_sweeper(registry: &Arc<SessionRegistry>, every: Duration) -> JoinHandle<()> {
    let registry: Weak<SessionRegistry> = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let flushed = registry.sweep().await;
            if flushed > 0 {
                debug!("sweep flushed {flushed} record(s)");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LiveDocument;
    use crate::identity::DocumentIdentity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` durable writes.
    #[derive(Default)]
    struct FlakyBinder {
        failures: u32,
        writes: AtomicU32,
    }

    #[async_trait]
    impl DocumentBinder for FlakyBinder {
        async fn bind(&self, _id: &str, _document: &LiveDocument) -> Result<(), CollabError> {
            Ok(())
        }

        async fn write(&self, _id: &str, _document: &LiveDocument, _durability: Durability) -> Result<(), CollabError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn write_with_retry(
            &self,
            _id: &str,
            _document: &LiveDocument,
            attempts: u32,
            _backoff: Duration,
        ) -> Result<u32, CollabError> {
            if self.failures >= attempts {
                return Err(CollabError::StoreUnavailable(crate::storage::StoreError::Unavailable(
                    "offline".into(),
                )));
            }
            Ok(self.failures + 1)
        }
    }

    fn dirty_record() -> SessionRecord {
        let record = SessionRecord::new(DocumentIdentity::log("T1"), 8);
        record.mark_mutated();
        record.mark_mutated();
        record
    }

    #[tokio::test]
    async fn test_cache_only_flush_leaves_record_dirty() {
        let record = dirty_record();
        let binder = FlakyBinder::default();

        assert!(flush(&record, &binder, Durability::CacheOnly).await.unwrap());
        assert_eq!(record.cached_revision(), 2);
        assert!(record.is_dirty());

        assert!(flush(&record, &binder, Durability::Durable).await.unwrap());
        assert!(!record.is_dirty());
        assert_eq!(binder.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_after_final_flush_is_skipped() {
        let record = dirty_record();
        let binder = FlakyBinder::default();

        assert!(flush_final(&record, &binder, &FlushPolicy::for_testing()).await);
        assert!(record.is_retired());
        assert!(!record.is_dirty());

        assert!(!flush(&record, &binder, Durability::Durable).await.unwrap());
        assert_eq!(binder.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_final_flush_retires_dirty_record() {
        let record = dirty_record();
        let binder = FlakyBinder {
            failures: 10,
            ..Default::default()
        };

        assert!(!flush_final(&record, &binder, &FlushPolicy::for_testing()).await);
        assert!(record.is_retired());
        assert!(record.is_dirty());
        assert_eq!(record.durable_revision(), 0);
    }

    #[tokio::test]
    async fn test_worker_honours_max_delay_under_constant_edits() {
        let record = Arc::new(SessionRecord::new(DocumentIdentity::log("T1"), 8));
        let binder = Arc::new(FlakyBinder::default());
        let policy = FlushPolicy {
            debounce: Duration::from_millis(30),
            max_delay: Duration::from_millis(80),
            ..FlushPolicy::for_testing()
        };
        let worker = FlushWorker::spawn(record.clone(), binder.clone(), policy);

        // Edits every 10ms never leave 30ms of quiet.
        for _ in 0..20 {
            record.mark_mutated();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.stop().await;
        assert!(binder.writes.load(Ordering::SeqCst) >= 1);
    }
}
