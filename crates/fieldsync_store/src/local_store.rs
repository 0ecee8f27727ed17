//! Typed local store for entity records and queued mutations.

use crate::backend::StorageBackend;
use crate::codec;
use crate::error::StoreResult;
use fieldsync_protocol::{Collection, EntityId, EntityRecord, MutationId, QueuedMutation};
use std::sync::Arc;

/// Namespace prefix for entity records; one namespace per collection.
fn entity_namespace(collection: Collection) -> String {
    format!("entities:{collection}")
}

/// Namespace holding queued mutations, keyed by mutation id.
const QUEUE_NAMESPACE: &str = "queue";

/// Durable keyed storage for the engine's two persistent collections:
/// entity records keyed by `(collection, id)` and queued mutations keyed
/// by mutation id. Both are fully enumerable, which is what startup
/// recovery relies on.
///
/// The store is a thin typed layer; all durability guarantees come from
/// the [`StorageBackend`] underneath. Callers coordinate ordering
/// themselves; the engine serializes access per entity id.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
}

impl LocalStore {
    /// Creates a store over the given backend.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    // ── Entity records ───────────────────────────────────────────

    /// Stores an entity record, replacing any prior version.
    ///
    /// Durable before the call returns.
    pub fn put(&self, record: &EntityRecord) -> StoreResult<()> {
        let bytes = codec::encode(record)?;
        self.backend
            .put(&entity_namespace(record.collection), record.id.as_str(), &bytes)
    }

    /// Returns the record for `(collection, id)`, if present.
    pub fn get(&self, collection: Collection, id: &EntityId) -> StoreResult<Option<EntityRecord>> {
        match self.backend.get(&entity_namespace(collection), id.as_str())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns every record in a collection. Order is unspecified.
    pub fn get_all(&self, collection: Collection) -> StoreResult<Vec<EntityRecord>> {
        self.backend
            .scan(&entity_namespace(collection))?
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }

    /// Removes the record for `(collection, id)`. Returns true if it existed.
    pub fn delete(&self, collection: Collection, id: &EntityId) -> StoreResult<bool> {
        self.backend.delete(&entity_namespace(collection), id.as_str())
    }

    // ── Queued mutations ─────────────────────────────────────────

    /// Stores a queued mutation, replacing any prior version under its id.
    pub fn put_mutation(&self, mutation: &QueuedMutation) -> StoreResult<()> {
        let bytes = codec::encode(mutation)?;
        self.backend
            .put(QUEUE_NAMESPACE, &mutation.id.to_string(), &bytes)
    }

    /// Returns the queued mutation with the given id, if present.
    pub fn get_mutation(&self, id: MutationId) -> StoreResult<Option<QueuedMutation>> {
        match self.backend.get(QUEUE_NAMESPACE, &id.to_string())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns every queued mutation. Order is unspecified; the queue
    /// imposes the processing order.
    pub fn mutations(&self) -> StoreResult<Vec<QueuedMutation>> {
        self.backend
            .scan(QUEUE_NAMESPACE)?
            .into_iter()
            .map(|(_, bytes)| codec::decode(&bytes))
            .collect()
    }

    /// Removes the queued mutation with the given id. Returns true if it
    /// existed.
    pub fn delete_mutation(&self, id: MutationId) -> StoreResult<bool> {
        self.backend.delete(QUEUE_NAMESPACE, &id.to_string())
    }
}
