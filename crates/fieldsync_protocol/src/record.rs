//! Entity records as held in the local store.

use crate::payload::{Collection, Payload};
use crate::types::{EntityId, Timestamp, VersionMarker};
use serde::{Deserialize, Serialize};

/// Where an entity stands relative to the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// A local write exists that has not been uploaded.
    Pending,
    /// A sync run is currently uploading this entity's mutation.
    Syncing,
    /// Local and remote agree as far as the engine knows.
    Synced,
    /// An open conflict blocks sync for this entity.
    Conflict,
    /// The last mutation for this entity failed terminally.
    Failed,
}

/// Upload priority of an entity's mutations.
///
/// Lower rank is more urgent; the queue processes critical before high
/// before normal before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must reach the backend as soon as possible.
    Critical,
    /// Urgent.
    High,
    /// Default.
    Normal,
    /// Can wait.
    Low,
}

impl Priority {
    /// Numeric rank used as the primary queue sort key (critical=0 ... low=3).
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A single entity as tracked locally.
///
/// Records are owned exclusively by the local store. The sync engine
/// mutates `sync_status` and `version`; the realtime subscriber replaces
/// `payload` when an accepted remote event lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable entity id.
    pub id: EntityId,
    /// The collection this entity belongs to.
    pub collection: Collection,
    /// The current local payload.
    pub payload: Payload,
    /// Last local modification time.
    pub updated_at: Timestamp,
    /// Sync state of the entity.
    pub sync_status: SyncStatus,
    /// Upload priority for this entity's mutations.
    pub priority: Priority,
    /// The last remote version this record is known to reflect.
    ///
    /// `None` until the backend has acknowledged the entity once. Used to
    /// detect divergence and to ignore re-delivered change events.
    pub version: Option<VersionMarker>,
}

impl EntityRecord {
    /// Creates a new pending record from a local write.
    #[must_use]
    pub fn new_pending(id: EntityId, payload: Payload, priority: Priority) -> Self {
        let collection = payload.collection();
        Self {
            id,
            collection,
            payload,
            updated_at: Timestamp::now(),
            sync_status: SyncStatus::Pending,
            priority,
            version: None,
        }
    }

    /// Returns true if a remote event at `version` has already been applied.
    #[must_use]
    pub fn has_seen(&self, version: VersionMarker) -> bool {
        self.version.is_some_and(|v| v >= version)
    }
}
