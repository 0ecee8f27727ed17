//! Applies inbound change events to local state.

use crate::conflict::ConflictResolver;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::locks::EntityLocks;
use crate::queue::MutationQueue;
use fieldsync_protocol::{
    ChangeEventType, ChangeStreamEvent, EntityRecord, SyncConflict, SyncStatus,
};
use fieldsync_store::LocalStore;
use std::sync::Arc;
use tracing::debug;

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was applied to the local store.
    Applied,
    /// The event was already reflected locally (re-delivery).
    Skipped,
    /// A conflict is open for the entity; the event was buffered.
    Buffered,
    /// The event opened a new conflict and was not applied.
    ConflictOpened,
}

/// Runs every inbound change event through conflict detection before it
/// touches the local store.
///
/// All work happens under the entity's lock, the same serialization
/// point the sync engine uses, so a remote event can never interleave
/// with a local status transition on the same entity.
pub struct RemoteApplier {
    store: LocalStore,
    queue: Arc<MutationQueue>,
    resolver: Arc<ConflictResolver>,
    locks: Arc<EntityLocks>,
    bus: EventBus,
}

impl RemoteApplier {
    /// Creates an applier.
    #[must_use]
    pub fn new(
        store: LocalStore,
        queue: Arc<MutationQueue>,
        resolver: Arc<ConflictResolver>,
        locks: Arc<EntityLocks>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            locks,
            bus,
        }
    }

    /// Applies one inbound event.
    pub async fn apply(&self, event: ChangeStreamEvent) -> EngineResult<ApplyOutcome> {
        let _guard = self.locks.lock(event.collection, &event.entity_id).await;
        self.apply_locked(event)
    }

    /// Applies one event with the entity lock already held by the caller.
    ///
    /// Used when draining events buffered during a conflict, where the
    /// resolution path holds the lock.
    pub fn apply_locked(&self, event: ChangeStreamEvent) -> EngineResult<ApplyOutcome> {
        if self.resolver.has_open(event.collection, &event.entity_id) {
            debug!(entity = %event.entity_id, "event buffered behind open conflict");
            self.resolver.buffer_event(event);
            return Ok(ApplyOutcome::Buffered);
        }

        let record = self.store.get(event.collection, &event.entity_id)?;

        // Re-delivered or out-of-order events the record already reflects
        // are dropped; applying twice must equal applying once.
        if record.as_ref().is_some_and(|r| r.has_seen(event.version)) {
            return Ok(ApplyOutcome::Skipped);
        }

        let pending = self.queue.pending_for(event.collection, &event.entity_id)?;
        if let Some(conflict_type) = self
            .resolver
            .detect(record.as_ref(), pending.as_ref(), &event)
        {
            let conflict = SyncConflict::new(
                event.collection,
                event.entity_id.clone(),
                record.as_ref().map(|r| r.payload.clone()),
                event.new_payload.clone(),
                conflict_type,
                event.version,
            );
            self.resolver.open_conflict(conflict)?;
            return Ok(ApplyOutcome::ConflictOpened);
        }

        match event.event_type {
            ChangeEventType::Insert | ChangeEventType::Update => {
                let Some(payload) = event.new_payload else {
                    return Err(EngineError::Protocol(format!(
                        "{:?} event without payload for {}",
                        event.event_type, event.entity_id
                    )));
                };
                let mut record = record.unwrap_or_else(|| {
                    EntityRecord::new_pending(
                        event.entity_id.clone(),
                        payload.clone(),
                        Default::default(),
                    )
                });
                record.payload = payload;
                record.sync_status = SyncStatus::Synced;
                record.version = Some(event.version);
                record.updated_at = event.occurred_at;
                self.store.put(&record)?;

                self.bus.publish(EngineEvent::EntitySaved {
                    collection: event.collection,
                    entity_id: event.entity_id,
                });
            }
            ChangeEventType::Delete => {
                self.store.delete(event.collection, &event.entity_id)?;
                self.bus.publish(EngineEvent::EntityRemoved {
                    collection: event.collection,
                    entity_id: event.entity_id,
                });
            }
        }

        Ok(ApplyOutcome::Applied)
    }
}
