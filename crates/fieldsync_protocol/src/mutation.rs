//! Queued mutations and the outbound mutation wire types.

use crate::payload::{Collection, Payload};
use crate::record::Priority;
use crate::types::{EntityId, MutationId, Timestamp, VersionMarker};
use serde::{Deserialize, Serialize};

/// The kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMethod {
    /// Create a new entity.
    Create,
    /// Update an existing entity.
    Update,
    /// Delete an entity.
    Delete,
}

/// A local write waiting for delivery to the remote backend.
///
/// Queue items are durable: they survive restarts and are removed only on
/// acknowledgment or terminal failure. The `id` doubles as the backend's
/// idempotency key, so re-delivery after a crash or retry is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Mutation id and idempotency key.
    pub id: MutationId,
    /// What the mutation does.
    pub method: MutationMethod,
    /// Target collection.
    pub collection: Collection,
    /// Target entity.
    pub entity_id: EntityId,
    /// New payload (absent for deletes).
    pub payload: Option<Payload>,
    /// The remote version the write was based on, if known.
    pub based_on: Option<VersionMarker>,
    /// Upload priority.
    pub priority: Priority,
    /// When the mutation was enqueued.
    pub enqueued_at: Timestamp,
    /// How many delivery attempts have failed so far.
    pub retry_count: u32,
    /// Attempts after which the mutation is dropped terminally.
    pub max_retries: u32,
    /// Earliest time the next delivery attempt may run (backoff schedule).
    pub next_attempt_at: Timestamp,
}

impl QueuedMutation {
    /// Creates a fresh mutation with a generated id and zero retries.
    #[must_use]
    pub fn new(
        method: MutationMethod,
        collection: Collection,
        entity_id: EntityId,
        payload: Option<Payload>,
        based_on: Option<VersionMarker>,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: MutationId::generate(),
            method,
            collection,
            entity_id,
            payload,
            based_on,
            priority,
            enqueued_at: now,
            retry_count: 0,
            max_retries,
            next_attempt_at: now,
        }
    }

    /// Builds the wire request for this mutation.
    #[must_use]
    pub fn to_request(&self) -> MutationRequest {
        MutationRequest {
            mutation_id: self.id,
            method: self.method,
            collection: self.collection,
            entity_id: self.entity_id.clone(),
            payload: self.payload.clone(),
            base_version: self.based_on,
        }
    }
}

/// The outbound mutation call, issued once per queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Idempotency key; the backend deduplicates on it.
    pub mutation_id: MutationId,
    /// What the mutation does.
    pub method: MutationMethod,
    /// Target collection.
    pub collection: Collection,
    /// Target entity.
    pub entity_id: EntityId,
    /// New payload (absent for deletes).
    pub payload: Option<Payload>,
    /// The remote version the write was based on, if known.
    pub base_version: Option<VersionMarker>,
}

/// The backend's answer to a mutation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationAck {
    /// The mutation was applied (or had already been applied under the
    /// same idempotency key); `version` is the entity's new remote version.
    Applied {
        /// New remote version of the entity.
        version: VersionMarker,
    },
    /// The backend rejected the payload permanently; retrying is pointless.
    Rejected {
        /// Human-readable rejection reason.
        reason: String,
    },
}

impl MutationAck {
    /// Returns true if the mutation was applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationAck::Applied { .. })
    }
}
