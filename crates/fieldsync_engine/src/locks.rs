//! Per-entity serialization.
//!
//! The local store is shared by the sync engine (status transitions) and
//! the remote applier (payload replacement). There is no true
//! parallelism, but the two paths interleave at await points, so every
//! read-modify-write sequence on one entity goes through the entity's
//! async mutex. Different entities never contend.

use fieldsync_protocol::{Collection, EntityId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Registry of per-entity async locks.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<(Collection, EntityId), Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for one entity, creating it on first use.
    pub async fn lock(&self, collection: Collection, id: &EntityId) -> OwnedMutexGuard<()> {
        let entity_lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry((collection, id.clone()))
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        entity_lock.lock_owned().await
    }

    /// Number of entities a lock has been created for.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns true if no locks have been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn same_entity_is_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let in_section = Arc::new(AtomicU32::new(0));
        let id = EntityId::new("p-1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(Collection::Projects, &id).await;
                assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(in_section.fetch_sub(1, Ordering::SeqCst), 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_entities_do_not_contend() {
        let locks = EntityLocks::new();
        let a = locks.lock(Collection::Projects, &EntityId::new("a")).await;
        // Holding `a` must not block `b`.
        let _b = locks.lock(Collection::Projects, &EntityId::new("b")).await;
        drop(a);
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn same_id_different_collection_is_independent() {
        let locks = EntityLocks::new();
        let a = locks.lock(Collection::Projects, &EntityId::new("x")).await;
        let _b = locks.lock(Collection::Equipment, &EntityId::new("x")).await;
        drop(a);
    }
}
