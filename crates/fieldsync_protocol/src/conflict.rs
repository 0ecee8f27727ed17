//! Conflicts between local and remote state.

use crate::payload::{Collection, Payload};
use crate::types::{ConflictId, EntityId, Timestamp, VersionMarker};
use serde::{Deserialize, Serialize};

/// How local and remote state diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides updated the same entity.
    ConcurrentUpdate,
    /// One side deleted while the other updated.
    DeleteVsUpdate,
}

/// A detected divergence between local and remote state for one entity.
///
/// At most one conflict is open per entity at a time. A conflict holds
/// both payloads intact until an explicit terminal resolution removes it;
/// resolution cannot be undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: ConflictId,
    /// The collection the entity lives in.
    pub collection: Collection,
    /// The conflicted entity.
    pub entity_id: EntityId,
    /// The local payload at detection time (absent if locally deleted).
    pub local_payload: Option<Payload>,
    /// The remote payload from the conflicting event (absent for deletes).
    pub remote_payload: Option<Payload>,
    /// How the divergence happened.
    pub conflict_type: ConflictType,
    /// The remote version carried by the conflicting event.
    pub remote_version: VersionMarker,
    /// When the conflict was detected.
    pub created_at: Timestamp,
}

impl SyncConflict {
    /// Creates a new conflict with a fresh id.
    #[must_use]
    pub fn new(
        collection: Collection,
        entity_id: EntityId,
        local_payload: Option<Payload>,
        remote_payload: Option<Payload>,
        conflict_type: ConflictType,
        remote_version: VersionMarker,
    ) -> Self {
        Self {
            id: ConflictId::generate(),
            collection,
            entity_id,
            local_payload,
            remote_payload,
            conflict_type,
            remote_version,
            created_at: Timestamp::now(),
        }
    }

    /// Returns true when one side deleted the entity.
    #[must_use]
    pub fn involves_delete(&self) -> bool {
        self.conflict_type == ConflictType::DeleteVsUpdate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{EstimateDoc, Payload};

    fn estimate(amount: i64) -> Payload {
        Payload::Estimates(EstimateDoc {
            schema_version: 1,
            customer: "Acme Paving".to_string(),
            amount_cents: amount,
            accepted: None,
        })
    }

    #[test]
    fn concurrent_update_keeps_both_payloads() {
        let conflict = SyncConflict::new(
            Collection::Estimates,
            EntityId::new("est-1"),
            Some(estimate(100_00)),
            Some(estimate(120_00)),
            ConflictType::ConcurrentUpdate,
            VersionMarker::new(4),
        );
        assert!(conflict.local_payload.is_some());
        assert!(conflict.remote_payload.is_some());
        assert!(!conflict.involves_delete());
    }

    #[test]
    fn delete_vs_update() {
        let conflict = SyncConflict::new(
            Collection::Estimates,
            EntityId::new("est-1"),
            Some(estimate(100_00)),
            None,
            ConflictType::DeleteVsUpdate,
            VersionMarker::new(4),
        );
        assert!(conflict.involves_delete());
        assert!(conflict.remote_payload.is_none());
    }
}
