//! Batched upload of the mutation queue.

use crate::config::EngineConfig;
use crate::conflict::ConflictResolver;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus, SyncReport, SyncTrigger};
use crate::locks::EntityLocks;
use crate::monitor::ConnectionMonitor;
use crate::queue::{MutationQueue, RequeueOutcome};
use crate::transport::RemoteBackend;
use fieldsync_protocol::{MutationAck, QueuedMutation, SyncStatus, Timestamp};
use fieldsync_store::LocalStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Uploads queued mutations to the remote backend in batches.
///
/// # Run model
///
/// A run moves `idle -> running -> {completed | aborted}`. At most one
/// run is in flight: a trigger that lands mid-run is a no-op, never
/// queued. Runs are triggered by the online transition, the interval
/// timer, or an explicit call; all three funnel into
/// [`trigger`](Self::trigger).
///
/// A crash mid-run is safe: unacknowledged items stay in the durable
/// queue and re-deliver idempotently under their stable mutation id.
pub struct SyncEngine {
    config: EngineConfig,
    store: LocalStore,
    queue: Arc<MutationQueue>,
    resolver: Arc<ConflictResolver>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectionMonitor>,
    locks: Arc<EntityLocks>,
    bus: EventBus,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl SyncEngine {
    /// Creates a sync engine.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: LocalStore,
        queue: Arc<MutationQueue>,
        resolver: Arc<ConflictResolver>,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<ConnectionMonitor>,
        locks: Arc<EntityLocks>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            resolver,
            backend,
            monitor,
            locks,
            bus,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns true while a run is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests cancellation of the current run.
    ///
    /// The in-flight batch finishes; no further batches are dequeued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Attempts to start a sync run.
    ///
    /// Returns `Ok(None)` when no run happened: another run is in
    /// flight, or the network threshold gate is not met. Otherwise runs
    /// to completion and returns the report that was also emitted as
    /// [`EngineEvent::SyncCompleted`].
    pub async fn trigger(&self, trigger: SyncTrigger) -> EngineResult<Option<SyncReport>> {
        if !self.monitor.meets(self.config.network_threshold) {
            debug!(?trigger, "sync gated by network threshold");
            return Ok(None);
        }

        // Single-flight guard: a losing trigger is a no-op, not queued.
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(?trigger, "sync already running, trigger ignored");
            return Ok(None);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        info!(?trigger, "sync run started");
        self.bus.publish(EngineEvent::SyncStarted { trigger });

        let result = self.run().await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(report) => {
                info!(
                    synced = report.synced,
                    failed = report.failed,
                    remaining = report.remaining,
                    aborted = report.aborted,
                    "sync run finished"
                );
                self.bus.publish(EngineEvent::SyncCompleted {
                    report: report.clone(),
                });
                Ok(Some(report))
            }
            Err(e) => {
                warn!(error = %e, "sync run failed");
                self.bus.publish(EngineEvent::SyncFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// The run body: drain the queue batch by batch.
    async fn run(&self) -> EngineResult<SyncReport> {
        let started = Instant::now();
        let mut synced = 0u64;
        let mut failed = 0u64;
        let mut aborted = false;
        // A run attempts each item at most once; retries belong to later
        // runs, after the backoff window.
        let mut attempted = HashSet::new();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let batch = self
                .queue
                .dequeue_batch(self.config.batch_size, Timestamp::now())?;
            let fresh: Vec<_> = batch
                .into_iter()
                .filter(|m| !attempted.contains(&m.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            let mut progressed = false;
            for mutation in fresh {
                // Entities with an open conflict stay queued until the
                // conflict is resolved.
                if self
                    .resolver
                    .has_open(mutation.collection, &mutation.entity_id)
                {
                    debug!(entity = %mutation.entity_id, "skipping conflicted entity");
                    continue;
                }

                attempted.insert(mutation.id);
                progressed = true;
                match self.deliver(&mutation).await? {
                    DeliveryOutcome::Acked => synced += 1,
                    DeliveryOutcome::Failed => failed += 1,
                }
            }

            // A batch of nothing but conflicted entities would repeat
            // forever; stop and let resolution unblock them.
            if !progressed {
                break;
            }

            self.bus.publish(EngineEvent::SyncProgress {
                synced,
                failed,
                remaining: self.queue.pending_count()? as u64,
            });
        }

        Ok(SyncReport {
            synced,
            failed,
            remaining: self.queue.pending_count()? as u64,
            duration: started.elapsed(),
            aborted,
        })
    }

    /// Delivers one mutation and settles its queue/record state.
    async fn deliver(&self, mutation: &QueuedMutation) -> EngineResult<DeliveryOutcome> {
        let _guard = self
            .locks
            .lock(mutation.collection, &mutation.entity_id)
            .await;

        self.set_record_status(mutation, SyncStatus::Syncing)?;

        match self.backend.execute(&mutation.to_request()).await {
            Ok(MutationAck::Applied { version }) => {
                self.queue.ack(mutation.id)?;
                if let Some(mut record) =
                    self.store.get(mutation.collection, &mutation.entity_id)?
                {
                    record.sync_status = SyncStatus::Synced;
                    record.version = Some(version);
                    self.store.put(&record)?;
                }
                debug!(id = %mutation.id, %version, "mutation acknowledged");
                Ok(DeliveryOutcome::Acked)
            }
            Ok(MutationAck::Rejected { reason }) => {
                // Permanent validation failure: terminal immediately.
                self.queue.ack(mutation.id)?;
                self.set_record_status(mutation, SyncStatus::Failed)?;
                warn!(id = %mutation.id, %reason, "mutation rejected by backend");
                self.bus.publish(EngineEvent::MutationFailed {
                    mutation_id: mutation.id,
                    entity_id: mutation.entity_id.clone(),
                    collection: mutation.collection,
                    retry_count: mutation.retry_count,
                    reason,
                });
                Ok(DeliveryOutcome::Failed)
            }
            Err(e) if e.is_retryable() => {
                match self.queue.requeue(mutation.id, Timestamp::now())? {
                    RequeueOutcome::Rescheduled(_) => {
                        self.set_record_status(mutation, SyncStatus::Pending)?;
                    }
                    RequeueOutcome::Dropped => {
                        self.set_record_status(mutation, SyncStatus::Failed)?;
                    }
                }
                Ok(DeliveryOutcome::Failed)
            }
            Err(e) => {
                // Non-retryable transport failure: terminal, like a
                // rejection.
                self.queue.ack(mutation.id)?;
                self.set_record_status(mutation, SyncStatus::Failed)?;
                warn!(id = %mutation.id, error = %e, "mutation failed terminally");
                self.bus.publish(EngineEvent::MutationFailed {
                    mutation_id: mutation.id,
                    entity_id: mutation.entity_id.clone(),
                    collection: mutation.collection,
                    retry_count: mutation.retry_count,
                    reason: e.to_string(),
                });
                Ok(DeliveryOutcome::Failed)
            }
        }
    }

    fn set_record_status(
        &self,
        mutation: &QueuedMutation,
        status: SyncStatus,
    ) -> EngineResult<()> {
        if let Some(mut record) = self.store.get(mutation.collection, &mutation.entity_id)? {
            record.sync_status = status;
            self.store.put(&record)?;
        }
        Ok(())
    }
}

enum DeliveryOutcome {
    Acked,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Connectivity, LinkKind, LinkQuality};
    use crate::transport::MockBackend;
    use fieldsync_protocol::{
        Collection, EntityId, EntityRecord, MutationMethod, Payload, Priority, ProjectDoc,
        QueuedMutation, VersionMarker,
    };
    use fieldsync_store::InMemoryBackend;

    fn project(name: &str) -> Payload {
        Payload::Projects(ProjectDoc {
            schema_version: 1,
            name: name.to_string(),
            status: "active".to_string(),
            site: None,
            notes: None,
        })
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        store: LocalStore,
        queue: Arc<MutationQueue>,
        resolver: Arc<ConflictResolver>,
        backend: Arc<MockBackend>,
        monitor: Arc<ConnectionMonitor>,
        bus: EventBus,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let (bus, dispatcher) = EventBus::new();
        tokio::spawn(dispatcher.run());
        let store = LocalStore::new(Arc::new(InMemoryBackend::new()));
        let queue = Arc::new(MutationQueue::new(
            store.clone(),
            bus.clone(),
            config.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            Arc::clone(&queue),
            bus.clone(),
            config.max_retries,
        ));
        let backend = Arc::new(MockBackend::new());
        let monitor = Arc::new(ConnectionMonitor::new(bus.clone()));
        monitor.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));
        let locks = Arc::new(EntityLocks::new());

        let engine = Arc::new(SyncEngine::new(
            config,
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&resolver),
            Arc::clone(&backend) as Arc<dyn RemoteBackend>,
            Arc::clone(&monitor),
            locks,
            bus.clone(),
        ));
        Fixture {
            engine,
            store,
            queue,
            resolver,
            backend,
            monitor,
            bus,
        }
    }

    /// Seeds a pending record plus its queued mutation, as `save` would.
    fn seed(f: &Fixture, id: &str, priority: Priority) -> QueuedMutation {
        let record = EntityRecord::new_pending(EntityId::new(id), project(id), priority);
        f.store.put(&record).unwrap();
        let mutation = QueuedMutation::new(
            MutationMethod::Create,
            Collection::Projects,
            EntityId::new(id),
            Some(project(id)),
            None,
            priority,
            3,
        );
        f.queue.enqueue(mutation.clone()).unwrap();
        mutation
    }

    #[tokio::test]
    async fn drains_queue_and_reports() {
        let f = fixture(EngineConfig::new());
        seed(&f, "p-1", Priority::Normal);
        seed(&f, "p-2", Priority::Normal);
        seed(&f, "p-3", Priority::Critical);

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.remaining, 0);
        assert!(!report.aborted);

        // Records are synced and versioned.
        let record = f
            .store
            .get(Collection::Projects, &EntityId::new("p-1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.version, Some(VersionMarker::new(1)));

        // Critical entity went out first.
        assert_eq!(f.backend.executed()[0].entity_id, EntityId::new("p-3"));
    }

    #[tokio::test]
    async fn offline_gate_blocks_run() {
        let f = fixture(EngineConfig::new());
        f.monitor.set_connectivity(Connectivity::offline());
        seed(&f, "p-1", Priority::Normal);

        let outcome = f.engine.trigger(SyncTrigger::Interval).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.queue.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn wifi_only_gate() {
        let config = EngineConfig::new()
            .with_network_threshold(crate::config::NetworkThreshold::WifiOnly);
        let f = fixture(config);
        f.monitor
            .set_connectivity(Connectivity::online(LinkKind::Cellular, LinkQuality::Good));
        seed(&f, "p-1", Priority::Normal);

        assert!(f.engine.trigger(SyncTrigger::Manual).await.unwrap().is_none());

        f.monitor
            .set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));
        assert!(f.engine.trigger(SyncTrigger::Manual).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_trigger_mid_run_is_noop() {
        let f = fixture(EngineConfig::new());

        // Simulate a run already holding the guard.
        f.engine.running.store(true, Ordering::SeqCst);
        let outcome = f.engine.trigger(SyncTrigger::Manual).await.unwrap();
        assert!(outcome.is_none());
        f.engine.running.store(false, Ordering::SeqCst);

        // Guard released: the next trigger runs.
        let outcome = f.engine.trigger(SyncTrigger::Manual).await.unwrap();
        assert!(outcome.is_some());
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let f = fixture(EngineConfig::new());
        let mutation = seed(&f, "p-1", Priority::Normal);
        f.backend.fail_next(1);

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let requeued = f
            .queue
            .pending_for(Collection::Projects, &EntityId::new("p-1"))
            .unwrap()
            .unwrap();
        assert_eq!(requeued.id, mutation.id);
        assert_eq!(requeued.retry_count, 1);
        // Inside its backoff window now; record back to pending.
        let record = f
            .store
            .get(Collection::Projects, &EntityId::new("p-1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn unreachable_backend_requeues_everything() {
        let f = fixture(EngineConfig::new());
        seed(&f, "p-1", Priority::Normal);
        seed(&f, "p-2", Priority::Normal);
        f.backend.set_offline(true);

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.remaining, 2);
        assert!(f.backend.executed().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_terminal_without_retry() {
        let f = fixture(EngineConfig::new());
        let mut rx = f.bus.subscribe();
        let mutation = seed(&f, "p-1", Priority::Normal);
        f.backend.reject(mutation.id);

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 0);

        let record = f
            .store
            .get(Collection::Projects, &EntityId::new("p-1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);

        // Exactly one terminal event, with the rejection reason.
        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::MutationFailed { reason, .. } = event {
                assert_eq!(reason, "payload rejected");
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn conflicted_entity_is_skipped_but_stays_queued() {
        let f = fixture(EngineConfig::new());
        seed(&f, "p-1", Priority::Normal);
        seed(&f, "p-2", Priority::Normal);

        let conflict = fieldsync_protocol::SyncConflict::new(
            Collection::Projects,
            EntityId::new("p-1"),
            Some(project("local")),
            Some(project("remote")),
            fieldsync_protocol::ConflictType::ConcurrentUpdate,
            VersionMarker::new(2),
        );
        f.resolver.open_conflict(conflict).unwrap();

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.remaining, 1);

        // The conflicted mutation is still queued, untouched.
        assert!(f
            .queue
            .pending_for(Collection::Projects, &EntityId::new("p-1"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn batches_respect_batch_size_and_emit_progress() {
        let f = fixture(EngineConfig::new().with_batch_size(2));
        let mut rx = f.bus.subscribe();
        for i in 0..5 {
            seed(&f, &format!("p-{i}"), Priority::Normal);
        }

        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(f.backend.executed().len(), 5);

        // Batches of 2, 2, 1: one progress event per batch.
        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::SyncProgress { synced, .. } = event {
                progress.push(synced);
            }
        }
        assert_eq!(progress, vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn cancel_before_run_aborts_immediately() {
        let f = fixture(EngineConfig::new());
        seed(&f, "p-1", Priority::Normal);

        // Cancellation is checked before every batch; a cancel that lands
        // after the guard but before the first dequeue stops the run.
        f.engine.cancelled.store(false, Ordering::SeqCst);
        f.engine.cancel();
        let report = f.engine.run().await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn sync_events_are_emitted() {
        let f = fixture(EngineConfig::new());
        let mut rx = f.bus.subscribe();
        seed(&f, "p-1", Priority::Normal);

        f.engine.trigger(SyncTrigger::Online).await.unwrap();

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::SyncStarted {
                    trigger: SyncTrigger::Online,
                } => saw_started = true,
                EngineEvent::SyncCompleted { report } => {
                    assert_eq!(report.synced, 1);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn retry_then_success_uses_same_idempotency_key() {
        let f = fixture(EngineConfig::new().with_retry_base(std::time::Duration::ZERO));
        let mutation = seed(&f, "p-1", Priority::Normal);
        f.backend.fail_next(1);

        f.engine.trigger(SyncTrigger::Manual).await.unwrap();
        // Backoff base is zero, so the item is immediately eligible.
        let report = f
            .engine
            .trigger(SyncTrigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 1);

        let executed = f.backend.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].mutation_id, mutation.id);
    }
}
