//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::StoreResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory storage backend.
///
/// Stores everything in a map and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral engines that don't need persistence
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use fieldsync_store::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("queue", "m-1", b"bytes").unwrap();
/// assert_eq!(backend.get("queue", "m-1").unwrap(), Some(b"bytes".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored entries across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the backend holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl StorageBackend for InMemoryBackend {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .entries
            .write()
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }
}
