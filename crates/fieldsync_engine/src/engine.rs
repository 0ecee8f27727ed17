//! The engine facade.
//!
//! One [`Engine`] instance is constructed at process start and passed by
//! reference to every call site. There is no global state; dropping the
//! engine (after [`shutdown`](Engine::shutdown)) tears everything down.

use crate::applier::RemoteApplier;
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, SyncReport, SyncTrigger};
use crate::locks::EntityLocks;
use crate::monitor::{ConnectionMonitor, Connectivity};
use crate::queue::MutationQueue;
use crate::realtime::{ConnectionState, RealtimeSubscriber};
use crate::scheduler::Scheduler;
use crate::sync::SyncEngine;
use crate::transport::{ChangeStreamSource, RemoteBackend};
use fieldsync_protocol::{
    ChangeStreamEvent, Collection, ConflictId, EntityId, EntityRecord, MutationMethod, Payload,
    Priority, QueuedMutation, SyncConflict, SyncStatus, Timestamp,
};
use fieldsync_store::{LocalStore, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The offline-first sync engine.
///
/// Wires the local store, mutation queue, conflict resolver, sync
/// engine, realtime subscribers and connection monitor together and
/// exposes the operations the UI layer calls. All feedback to the UI
/// flows through the event bus; local writes return synchronously once
/// durable.
pub struct Engine {
    config: EngineConfig,
    store: LocalStore,
    bus: EventBus,
    monitor: Arc<ConnectionMonitor>,
    queue: Arc<MutationQueue>,
    resolver: Arc<ConflictResolver>,
    applier: Arc<RemoteApplier>,
    sync: Arc<SyncEngine>,
    streams: Arc<dyn ChangeStreamSource>,
    subscribers: Mutex<HashMap<Collection, Arc<RealtimeSubscriber>>>,
    locks: Arc<EntityLocks>,
    scheduler: Scheduler,
}

impl Engine {
    /// Opens the engine over the given storage backend and transports.
    ///
    /// Performs startup recovery: both durable collections are
    /// enumerated, and records stranded in `Syncing` by a crash mid-run
    /// are reset to `Pending` (their queue items are still present and
    /// re-deliver idempotently).
    ///
    /// Spawns the event dispatcher, the interval sync timer and the
    /// connectivity watcher under the engine's scheduler.
    pub fn open(
        config: EngineConfig,
        storage: Arc<dyn StorageBackend>,
        remote: Arc<dyn RemoteBackend>,
        streams: Arc<dyn ChangeStreamSource>,
    ) -> EngineResult<Self> {
        let (bus, dispatcher) = EventBus::new();
        let store = LocalStore::new(storage);
        let monitor = Arc::new(ConnectionMonitor::new(bus.clone()));
        let locks = Arc::new(EntityLocks::new());
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
        let applier = Arc::new(RemoteApplier::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&resolver),
            Arc::clone(&locks),
            bus.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            config.clone(),
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&resolver),
            remote,
            Arc::clone(&monitor),
            Arc::clone(&locks),
            bus.clone(),
        ));

        let engine = Self {
            config,
            store,
            bus,
            monitor,
            queue,
            resolver,
            applier,
            sync,
            streams,
            subscribers: Mutex::new(HashMap::new()),
            locks,
            scheduler: Scheduler::new(),
        };

        engine.recover()?;

        engine.scheduler.spawn("event-dispatcher", dispatcher.run());
        engine.spawn_interval_sync();
        engine.spawn_connectivity_sync();

        info!(
            pending = engine.queue.pending_count().unwrap_or(0),
            "engine opened"
        );
        Ok(engine)
    }

    /// Resets records stranded mid-upload by a crash.
    fn recover(&self) -> EngineResult<()> {
        for collection in Collection::ALL {
            for mut record in self.store.get_all(collection)? {
                if record.sync_status == SyncStatus::Syncing {
                    debug!(entity = %record.id, "resetting stranded syncing record");
                    record.sync_status = SyncStatus::Pending;
                    self.store.put(&record)?;
                }
            }
        }
        Ok(())
    }

    fn spawn_interval_sync(&self) {
        let sync = Arc::clone(&self.sync);
        let interval = self.config.sync_interval;
        self.scheduler.spawn("interval-sync", async move {
            let mut timer = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );
            loop {
                timer.tick().await;
                // Gating and the single-flight guard live in trigger().
                let _ = sync.trigger(SyncTrigger::Interval).await;
            }
        });
    }

    fn spawn_connectivity_sync(&self) {
        let sync = Arc::clone(&self.sync);
        let mut watch = self.monitor.watch();
        self.scheduler.spawn("connectivity-sync", async move {
            let mut was_online = watch.borrow().online;
            while watch.changed().await.is_ok() {
                let online = watch.borrow().online;
                if online && !was_online {
                    let _ = sync.trigger(SyncTrigger::Online).await;
                }
                was_online = online;
            }
        });
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Saves an entity locally and queues its upload.
    ///
    /// The record and the mutation are durable before this returns. The
    /// mutation is a create when the entity is unknown locally, an
    /// update otherwise, and is based on the record's last known remote
    /// version.
    pub async fn save(
        &self,
        id: EntityId,
        payload: Payload,
        priority: Priority,
    ) -> EngineResult<()> {
        let collection = payload.collection();
        let _guard = self.locks.lock(collection, &id).await;

        let existing = self.store.get(collection, &id)?;
        let method = match &existing {
            Some(_) => MutationMethod::Update,
            None => MutationMethod::Create,
        };
        let based_on = existing.as_ref().and_then(|r| r.version);

        let mut record = existing.unwrap_or_else(|| {
            EntityRecord::new_pending(id.clone(), payload.clone(), priority)
        });
        record.payload = payload.clone();
        record.priority = priority;
        record.sync_status = SyncStatus::Pending;
        record.updated_at = Timestamp::now();
        self.store.put(&record)?;

        self.queue.enqueue(QueuedMutation::new(
            method,
            collection,
            id.clone(),
            Some(payload),
            based_on,
            priority,
            self.config.max_retries,
        ))?;

        self.bus.publish(EngineEvent::EntitySaved {
            collection,
            entity_id: id,
        });
        Ok(())
    }

    /// Deletes an entity locally and queues the remote delete.
    pub async fn remove(
        &self,
        collection: Collection,
        id: EntityId,
        priority: Priority,
    ) -> EngineResult<()> {
        let _guard = self.locks.lock(collection, &id).await;

        let existing = self.store.get(collection, &id)?;
        let based_on = existing.as_ref().and_then(|r| r.version);
        self.store.delete(collection, &id)?;

        self.queue.enqueue(QueuedMutation::new(
            MutationMethod::Delete,
            collection,
            id.clone(),
            None,
            based_on,
            priority,
            self.config.max_retries,
        ))?;

        self.bus.publish(EngineEvent::EntityRemoved {
            collection,
            entity_id: id,
        });
        Ok(())
    }

    /// Returns one entity record.
    pub fn get(&self, collection: Collection, id: &EntityId) -> EngineResult<Option<EntityRecord>> {
        Ok(self.store.get(collection, id)?)
    }

    /// Returns every record in a collection.
    pub fn get_all(&self, collection: Collection) -> EngineResult<Vec<EntityRecord>> {
        Ok(self.store.get_all(collection)?)
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Triggers a sync run now. No-op (`Ok(None)`) if one is in flight
    /// or the network gate is closed.
    pub async fn sync_now(&self) -> EngineResult<Option<SyncReport>> {
        self.sync.trigger(SyncTrigger::Manual).await
    }

    /// Cancels the in-flight sync run, if any; the current batch
    /// finishes.
    pub fn cancel_sync(&self) {
        self.sync.cancel();
    }

    /// Number of mutations waiting for upload.
    pub fn pending_mutations(&self) -> EngineResult<usize> {
        self.queue.pending_count()
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Every open conflict, both payloads intact.
    #[must_use]
    pub fn open_conflicts(&self) -> Vec<SyncConflict> {
        self.resolver.open_conflicts()
    }

    /// Terminally resolves a conflict, then replays any remote events
    /// that were buffered behind it.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> EngineResult<()> {
        let conflict = self
            .resolver
            .find(conflict_id)
            .ok_or(EngineError::ConflictNotFound { conflict_id })?;

        let drained = {
            let _guard = self
                .locks
                .lock(conflict.collection, &conflict.entity_id)
                .await;
            self.resolver.resolve(conflict_id, resolution)?
        };

        for event in drained {
            let _guard = self.locks.lock(event.collection, &event.entity_id).await;
            self.applier.apply_locked(event)?;
        }
        Ok(())
    }

    // ── Realtime ─────────────────────────────────────────────────

    /// Starts the realtime subscription for a collection.
    ///
    /// One logical subscription per collection; starting twice is a
    /// no-op.
    pub fn start_realtime(&self, collection: Collection) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains_key(&collection) {
            return;
        }
        let subscriber = Arc::new(RealtimeSubscriber::new(
            collection,
            Arc::clone(&self.streams),
            Arc::clone(&self.applier),
            self.bus.clone(),
            self.config.clone(),
        ));
        subscribers.insert(collection, Arc::clone(&subscriber));
        self.scheduler
            .spawn(format!("realtime-{collection}"), subscriber.run());
    }

    /// Explicitly restarts a subscription, e.g. after it exhausted its
    /// reconnect attempts.
    pub fn restart_realtime(&self, collection: Collection) -> EngineResult<()> {
        let subscriber = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(&collection)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Protocol(format!("no subscription for {collection}"))
                })?
        };
        subscriber.stop();
        subscriber.reset();
        self.scheduler
            .spawn(format!("realtime-{collection}"), Arc::clone(&subscriber).run());
        Ok(())
    }

    /// Connection state of a collection's subscription.
    #[must_use]
    pub fn realtime_state(&self, collection: Collection) -> Option<ConnectionState> {
        self.subscribers
            .lock()
            .get(&collection)
            .map(|s| s.state())
    }

    /// Applied change events committed after `since`, for catch-up.
    #[must_use]
    pub fn events_since(
        &self,
        collection: Collection,
        since: Timestamp,
    ) -> Vec<ChangeStreamEvent> {
        self.subscribers
            .lock()
            .get(&collection)
            .map(|s| s.events_since(since))
            .unwrap_or_default()
    }

    // ── Environment & lifecycle ──────────────────────────────────

    /// Feeds a reachability observation from the environment.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.monitor.set_connectivity(connectivity);
    }

    /// Returns true if the backend is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Subscribes to the engine's event stream.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Stops subscriptions, cancels any sync run, and aborts every
    /// supervised task.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        for subscriber in self.subscribers.lock().values() {
            subscriber.stop();
        }
        self.sync.cancel();
        self.scheduler.shutdown();
    }
}
