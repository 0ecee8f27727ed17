//! Conflict detection and resolution.

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::queue::MutationQueue;
use fieldsync_protocol::{
    ChangeEventType, ChangeStreamEvent, Collection, ConflictId, ConflictType, EntityId,
    EntityRecord, MutationMethod, Payload, QueuedMutation, SyncConflict, SyncStatus, Timestamp,
    VersionMarker,
};
use fieldsync_store::LocalStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A caller-supplied merge of diverged payloads.
pub type MergeFn = Box<dyn FnOnce(&Payload, &Payload) -> Payload + Send>;

/// How to settle an open conflict.
pub enum Resolution {
    /// Discard the remote payload; the local mutation stays queued.
    ClientWins,
    /// Remote payload overwrites local state; the competing local
    /// mutation is dropped from the queue.
    ServerWins,
    /// Combine both payloads; the result becomes the local payload and is
    /// re-queued for sync.
    Merge(MergeFn),
    /// Keep the conflict open; both payloads stay exposed until a later
    /// terminal call.
    Manual,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::ClientWins => f.write_str("ClientWins"),
            Resolution::ServerWins => f.write_str("ServerWins"),
            Resolution::Merge(_) => f.write_str("Merge(..)"),
            Resolution::Manual => f.write_str("Manual"),
        }
    }
}

/// Detects divergence between local and remote state and applies
/// resolution strategies.
///
/// # Invariants
///
/// - At most one conflict is open per entity.
/// - While a conflict is open, remote events for that entity are buffered
///   here instead of being applied.
/// - Resolution is terminal: a resolved conflict is gone and cannot be
///   reopened with the same id.
pub struct ConflictResolver {
    store: LocalStore,
    queue: Arc<MutationQueue>,
    bus: EventBus,
    max_retries: u32,
    open: Mutex<HashMap<(Collection, EntityId), SyncConflict>>,
    buffered: Mutex<HashMap<(Collection, EntityId), Vec<ChangeStreamEvent>>>,
}

impl ConflictResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(
        store: LocalStore,
        queue: Arc<MutationQueue>,
        bus: EventBus,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            max_retries,
            open: Mutex::new(HashMap::new()),
            buffered: Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether a remote event conflicts with local state.
    ///
    /// A conflict is raised when the event is an update or delete for an
    /// entity that has a queued (pending or in-flight) local mutation the
    /// event's version diverges from. Events the record has already seen
    /// are the applier's business (skipped there), not conflicts.
    #[must_use]
    pub fn detect(
        &self,
        _record: Option<&EntityRecord>,
        pending: Option<&QueuedMutation>,
        event: &ChangeStreamEvent,
    ) -> Option<ConflictType> {
        if event.event_type == ChangeEventType::Insert {
            return None;
        }
        let pending = pending?;

        // An event at or below the mutation's base version is old news,
        // not divergence.
        let based_on = pending.based_on.unwrap_or(VersionMarker::new(0));
        if event.version <= based_on {
            return None;
        }

        let delete_involved = event.event_type == ChangeEventType::Delete
            || pending.method == MutationMethod::Delete;
        if delete_involved {
            Some(ConflictType::DeleteVsUpdate)
        } else {
            Some(ConflictType::ConcurrentUpdate)
        }
    }

    /// Returns true if the entity has an open conflict.
    #[must_use]
    pub fn has_open(&self, collection: Collection, entity_id: &EntityId) -> bool {
        self.open
            .lock()
            .contains_key(&(collection, entity_id.clone()))
    }

    /// Returns every open conflict.
    #[must_use]
    pub fn open_conflicts(&self) -> Vec<SyncConflict> {
        self.open.lock().values().cloned().collect()
    }

    /// Looks up an open conflict by id.
    #[must_use]
    pub fn find(&self, conflict_id: ConflictId) -> Option<SyncConflict> {
        self.open
            .lock()
            .values()
            .find(|c| c.id == conflict_id)
            .cloned()
    }

    /// Registers a conflict, marks the record, and notifies the UI layer.
    ///
    /// If the entity already has an open conflict the new one is
    /// discarded and its triggering event should be buffered instead.
    pub fn open_conflict(&self, conflict: SyncConflict) -> EngineResult<()> {
        let key = (conflict.collection, conflict.entity_id.clone());
        {
            let mut open = self.open.lock();
            if open.contains_key(&key) {
                return Ok(());
            }
            open.insert(key, conflict.clone());
        }

        if let Some(mut record) = self.store.get(conflict.collection, &conflict.entity_id)? {
            record.sync_status = SyncStatus::Conflict;
            self.store.put(&record)?;
        }

        info!(
            entity = %conflict.entity_id,
            kind = ?conflict.conflict_type,
            "conflict detected"
        );
        self.bus
            .publish(EngineEvent::ConflictDetected { conflict });
        Ok(())
    }

    /// Buffers a remote event that arrived while a conflict was open.
    pub fn buffer_event(&self, event: ChangeStreamEvent) {
        self.buffered
            .lock()
            .entry((event.collection, event.entity_id.clone()))
            .or_default()
            .push(event);
    }

    /// Number of buffered events for one entity.
    #[must_use]
    pub fn buffered_count(&self, collection: Collection, entity_id: &EntityId) -> usize {
        self.buffered
            .lock()
            .get(&(collection, entity_id.clone()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Settles an open conflict.
    ///
    /// Terminal strategies remove the conflict and return the entity's
    /// buffered remote events for the caller to replay through the normal
    /// apply path. `Manual` keeps the conflict open and returns nothing.
    ///
    /// The caller must hold the entity's lock.
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> EngineResult<Vec<ChangeStreamEvent>> {
        let conflict = self
            .find(conflict_id)
            .ok_or(EngineError::ConflictNotFound { conflict_id })?;
        let key = (conflict.collection, conflict.entity_id.clone());

        match resolution {
            Resolution::Manual => {
                // Stays open; the UI keeps both payloads until a terminal
                // strategy is chosen.
                return Ok(Vec::new());
            }
            Resolution::ClientWins => {
                if let Some(mut record) = self.store.get(conflict.collection, &conflict.entity_id)? {
                    record.sync_status = SyncStatus::Pending;
                    self.store.put(&record)?;
                }
                info!(entity = %conflict.entity_id, "conflict resolved: client wins");
            }
            Resolution::ServerWins => {
                self.queue
                    .remove_for_entity(conflict.collection, &conflict.entity_id)?;

                match &conflict.remote_payload {
                    Some(remote) => {
                        let existing =
                            self.store.get(conflict.collection, &conflict.entity_id)?;
                        let mut record = existing.unwrap_or_else(|| {
                            EntityRecord::new_pending(
                                conflict.entity_id.clone(),
                                remote.clone(),
                                Default::default(),
                            )
                        });
                        record.payload = remote.clone();
                        record.sync_status = SyncStatus::Synced;
                        record.version = Some(conflict.remote_version);
                        record.updated_at = Timestamp::now();
                        self.store.put(&record)?;
                    }
                    None => {
                        // Remote side deleted; so do we.
                        self.store.delete(conflict.collection, &conflict.entity_id)?;
                    }
                }
                info!(entity = %conflict.entity_id, "conflict resolved: server wins");
            }
            Resolution::Merge(merge) => {
                let (Some(local), Some(remote)) =
                    (&conflict.local_payload, &conflict.remote_payload)
                else {
                    return Err(EngineError::InvalidResolution(
                        "merge requires both payloads".to_string(),
                    ));
                };
                let merged = merge(local, remote);
                if merged.collection() != conflict.collection {
                    return Err(EngineError::InvalidResolution(
                        "merge changed the payload collection".to_string(),
                    ));
                }

                let existing = self.store.get(conflict.collection, &conflict.entity_id)?;
                let priority = existing
                    .as_ref()
                    .map(|r| r.priority)
                    .unwrap_or_default();
                let mut record = existing.unwrap_or_else(|| {
                    EntityRecord::new_pending(
                        conflict.entity_id.clone(),
                        merged.clone(),
                        priority,
                    )
                });
                record.payload = merged.clone();
                record.sync_status = SyncStatus::Pending;
                record.version = Some(conflict.remote_version);
                record.updated_at = Timestamp::now();
                self.store.put(&record)?;

                // The merged payload replaces whatever was queued.
                self.queue
                    .remove_for_entity(conflict.collection, &conflict.entity_id)?;
                self.queue.enqueue(QueuedMutation::new(
                    MutationMethod::Update,
                    conflict.collection,
                    conflict.entity_id.clone(),
                    Some(merged),
                    Some(conflict.remote_version),
                    priority,
                    self.max_retries,
                ))?;
                info!(entity = %conflict.entity_id, "conflict resolved: merge");
            }
        }

        self.open.lock().remove(&key);
        let drained = self.buffered.lock().remove(&key).unwrap_or_default();
        if !drained.is_empty() {
            warn!(
                entity = %key.1,
                count = drained.len(),
                "replaying events buffered during conflict"
            );
        }
        self.bus.publish(EngineEvent::ConflictResolved {
            conflict_id,
            entity_id: key.1,
        });
        Ok(drained)
    }
}
