//! # FieldSync Protocol
//!
//! Shared data model and wire types for the FieldSync engine.
//!
//! This crate defines:
//! - Identifier and timestamp newtypes
//! - The tagged payload union keyed by collection
//! - Entity records with sync status and priority
//! - Queued mutations and the outbound mutation wire types
//! - Inbound change-stream events
//! - Conflict records
//!
//! Everything here is plain data: no I/O, no async, no storage. The engine
//! and store crates both build on these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_stream;
mod conflict;
mod mutation;
mod payload;
mod record;
mod types;

pub use change_stream::{ChangeEventType, ChangeStreamEvent};
pub use conflict::{ConflictType, SyncConflict};
pub use mutation::{MutationAck, MutationMethod, MutationRequest, QueuedMutation};
pub use payload::{
    Collection, EquipmentDoc, EstimateDoc, InventoryDoc, Payload, ProjectDoc, UnknownCollection,
};
pub use record::{EntityRecord, Priority, SyncStatus};
pub use types::{ConflictId, EntityId, MutationId, Timestamp, VersionMarker};
