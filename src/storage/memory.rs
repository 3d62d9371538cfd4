//! In-process persistent tier.
//!
//! Behaves like [`crate::storage::disk::FileStore`] without touching the
//! filesystem; used for ephemeral runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::entry::PersistedEntry;
use crate::storage::{Container, PersistentTier, StorageError};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, PersistedEntry>>,
    containers: Mutex<HashMap<String, Container>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container directly.
    pub fn insert_container(&self, container: Container) {
        self.containers.lock().insert(container.id.clone(), container);
    }

    /// Snapshot of a container's current items.
    pub fn container_items(&self, id: &str) -> Option<Vec<String>> {
        self.containers.lock().get(id).map(|c| c.items.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn contains_entry(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[async_trait]
impl PersistentTier for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<PersistedEntry>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, entry: &PersistedEntry) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn read_container(&self, id: &str) -> Result<Option<Container>, StorageError> {
        Ok(self.containers.lock().get(id).cloned())
    }

    async fn write_container(&self, container: &Container) -> Result<(), StorageError> {
        self.containers
            .lock()
            .insert(container.id.clone(), container.clone());
        Ok(())
    }
}
