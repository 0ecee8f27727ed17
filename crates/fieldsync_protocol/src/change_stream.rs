//! Inbound change-stream events.

use crate::payload::{Collection, Payload};
use crate::types::{EntityId, Timestamp, VersionMarker};
use serde::{Deserialize, Serialize};

/// The kind of change a stream event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    /// Entity appeared remotely.
    Insert,
    /// Entity was modified remotely.
    Update,
    /// Entity was removed remotely.
    Delete,
}

/// A single event from a remote collection's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStreamEvent {
    /// What happened.
    pub event_type: ChangeEventType,
    /// The collection the entity lives in.
    pub collection: Collection,
    /// The affected entity.
    pub entity_id: EntityId,
    /// The payload before the change, when the backend provides it.
    pub old_payload: Option<Payload>,
    /// The payload after the change (absent for deletes).
    pub new_payload: Option<Payload>,
    /// The entity's remote version after this change.
    pub version: VersionMarker,
    /// When the change was committed remotely.
    pub occurred_at: Timestamp,
}

impl ChangeStreamEvent {
    /// Creates an insert event.
    #[must_use]
    pub fn insert(entity_id: EntityId, payload: Payload, version: VersionMarker) -> Self {
        let collection = payload.collection();
        Self {
            event_type: ChangeEventType::Insert,
            collection,
            entity_id,
            old_payload: None,
            new_payload: Some(payload),
            version,
            occurred_at: Timestamp::now(),
        }
    }

    /// Creates an update event.
    #[must_use]
    pub fn update(entity_id: EntityId, payload: Payload, version: VersionMarker) -> Self {
        let collection = payload.collection();
        Self {
            event_type: ChangeEventType::Update,
            collection,
            entity_id,
            old_payload: None,
            new_payload: Some(payload),
            version,
            occurred_at: Timestamp::now(),
        }
    }

    /// Creates a delete event.
    #[must_use]
    pub fn delete(collection: Collection, entity_id: EntityId, version: VersionMarker) -> Self {
        Self {
            event_type: ChangeEventType::Delete,
            collection,
            entity_id,
            old_payload: None,
            new_payload: None,
            version,
            occurred_at: Timestamp::now(),
        }
    }

    /// Attaches the pre-change payload.
    #[must_use]
    pub fn with_old_payload(mut self, payload: Payload) -> Self {
        self.old_payload = Some(payload);
        self
    }
}
