//! Durable, ordered queue of pending local writes.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};
use fieldsync_protocol::{Collection, EntityId, MutationId, QueuedMutation, Timestamp};
use fieldsync_store::LocalStore;
use std::cmp::Reverse;
use tracing::{debug, warn};

/// Outcome of [`MutationQueue::requeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The mutation was rescheduled; next attempt no earlier than this.
    Rescheduled(Timestamp),
    /// The mutation hit its retry limit and was dropped terminally.
    Dropped,
}

/// The durable mutation queue.
///
/// Built on the local store's queue namespace, so items survive restarts
/// and a crash mid-sync leaves unacknowledged items in place.
///
/// # Ordering
///
/// Processing order is priority ascending (critical=0 ... low=3), then
/// enqueue time **descending** within a tier: the freshest write in a
/// tier ships first. One exception: mutations for the same entity always
/// ship in enqueue order, so an item is eligible only once no
/// earlier-enqueued item for its entity remains queued.
pub struct MutationQueue {
    store: LocalStore,
    bus: EventBus,
    config: EngineConfig,
}

impl MutationQueue {
    /// Creates a queue over the given store.
    #[must_use]
    pub fn new(store: LocalStore, bus: EventBus, config: EngineConfig) -> Self {
        Self { store, bus, config }
    }

    /// Enqueues a mutation durably.
    ///
    /// Idempotent: re-enqueueing an id that is already queued is a no-op.
    /// Returns true if the mutation was actually added.
    pub fn enqueue(&self, mutation: QueuedMutation) -> EngineResult<bool> {
        if self.store.get_mutation(mutation.id)?.is_some() {
            debug!(id = %mutation.id, "duplicate enqueue ignored");
            return Ok(false);
        }
        self.store.put_mutation(&mutation)?;
        Ok(true)
    }

    /// Returns up to `n` items in processing order.
    ///
    /// Items inside their backoff window are not eligible, and neither is
    /// an item with an earlier-enqueued sibling for the same entity.
    /// Returned items stay queued until [`ack`](Self::ack)ed.
    pub fn dequeue_batch(&self, n: usize, now: Timestamp) -> EngineResult<Vec<QueuedMutation>> {
        let all = self.store.mutations()?;

        let mut eligible: Vec<QueuedMutation> = all
            .iter()
            .filter(|m| m.next_attempt_at <= now)
            .filter(|m| {
                !all.iter().any(|other| {
                    other.id != m.id
                        && other.collection == m.collection
                        && other.entity_id == m.entity_id
                        && (other.enqueued_at, other.id.as_uuid())
                            < (m.enqueued_at, m.id.as_uuid())
                })
            })
            .cloned()
            .collect();

        eligible.sort_by_key(|m| (m.priority.rank(), Reverse((m.enqueued_at, m.id.as_uuid()))));
        eligible.truncate(n);
        Ok(eligible)
    }

    /// Removes an acknowledged item durably.
    ///
    /// Returns true if the item was still queued.
    pub fn ack(&self, id: MutationId) -> EngineResult<bool> {
        Ok(self.store.delete_mutation(id)?)
    }

    /// Records a failed delivery attempt.
    ///
    /// Increments `retry_count` and reschedules with exponential backoff.
    /// Once `retry_count` reaches `max_retries` the item is dropped and a
    /// single terminal [`EngineEvent::MutationFailed`] is emitted.
    pub fn requeue(&self, id: MutationId, now: Timestamp) -> EngineResult<RequeueOutcome> {
        let Some(mut mutation) = self.store.get_mutation(id)? else {
            // Already acked or dropped; nothing to reschedule.
            return Ok(RequeueOutcome::Dropped);
        };

        mutation.retry_count += 1;

        if mutation.retry_count >= mutation.max_retries {
            self.store.delete_mutation(id)?;
            warn!(
                id = %mutation.id,
                entity = %mutation.entity_id,
                retries = mutation.retry_count,
                "mutation dropped after exhausting retries"
            );
            self.bus.publish(EngineEvent::MutationFailed {
                mutation_id: mutation.id,
                entity_id: mutation.entity_id,
                collection: mutation.collection,
                retry_count: mutation.retry_count,
                reason: "retries exhausted".to_string(),
            });
            return Ok(RequeueOutcome::Dropped);
        }

        let delay = self.config.retry_delay(mutation.retry_count);
        mutation.next_attempt_at = now.plus_millis(delay.as_millis() as u64);
        self.store.put_mutation(&mutation)?;
        debug!(
            id = %mutation.id,
            retries = mutation.retry_count,
            next = mutation.next_attempt_at.as_millis(),
            "mutation rescheduled"
        );
        Ok(RequeueOutcome::Rescheduled(mutation.next_attempt_at))
    }

    /// Number of items currently queued.
    pub fn pending_count(&self) -> EngineResult<usize> {
        Ok(self.store.mutations()?.len())
    }

    /// The oldest queued mutation for one entity, if any.
    pub fn pending_for(
        &self,
        collection: Collection,
        entity_id: &EntityId,
    ) -> EngineResult<Option<QueuedMutation>> {
        let mut for_entity: Vec<QueuedMutation> = self
            .store
            .mutations()?
            .into_iter()
            .filter(|m| m.collection == collection && &m.entity_id == entity_id)
            .collect();
        for_entity.sort_by_key(|m| (m.enqueued_at, m.id.as_uuid()));
        Ok(for_entity.into_iter().next())
    }

    /// Drops every queued mutation for one entity (server-wins path).
    ///
    /// Returns how many items were removed. No failure events fire; the
    /// drop is a resolution, not a delivery failure.
    pub fn remove_for_entity(
        &self,
        collection: Collection,
        entity_id: &EntityId,
    ) -> EngineResult<usize> {
        let doomed: Vec<MutationId> = self
            .store
            .mutations()?
            .into_iter()
            .filter(|m| m.collection == collection && &m.entity_id == entity_id)
            .map(|m| m.id)
            .collect();
        for id in &doomed {
            self.store.delete_mutation(*id)?;
        }
        Ok(doomed.len())
    }
}
