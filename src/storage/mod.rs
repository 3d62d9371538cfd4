//! Persistence consumed by the cache and the write queue.
//!
//! - [`PersistentTier`]: the durable tier behind the memory cache, plus the
//!   container lists the migration coordinator moves items between
//! - [`disk`]: file-backed persistent tier
//! - [`memory`]: in-process persistent tier (tests, ephemeral runs)
//! - [`engine`]: storage engines for the durable write queue, tried at
//!   runtime from most to least capable

pub mod disk;
pub mod engine;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::entry::PersistedEntry;

pub type ItemId = String;
pub type ContainerId = String;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage capacity exceeded: {needed} bytes needed, limit is {limit}")]
    CapacityExceeded { needed: usize, limit: usize },
}

/// A logical container (a conversation) holding an ordered list of item ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub items: Vec<ItemId>,
}

impl Container {
    pub fn new(id: impl Into<ContainerId>, items: Vec<ItemId>) -> Self {
        Self {
            id: id.into(),
            items,
        }
    }
}

/// The local durable tier.
#[async_trait]
pub trait PersistentTier: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<PersistedEntry>, StorageError>;

    async fn write(&self, key: &str, entry: &PersistedEntry) -> Result<(), StorageError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn read_container(&self, id: &str) -> Result<Option<Container>, StorageError>;

    async fn write_container(&self, container: &Container) -> Result<(), StorageError>;
}
