//! File-backed persistent tier.
//!
//! Entries and containers are JSON files under a root directory. File names
//! are name-based UUIDs of the key so arbitrary keys map to safe, stable
//! paths. Writes go to a temporary file first and are renamed into place, so
//! a crash never leaves a half-written record behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::cache::entry::PersistedEntry;
use crate::storage::{Container, PersistentTier, StorageError};

/// Persistent tier rooted at a directory.
pub struct FileStore {
    root: PathBuf,
    stats: FileStoreStats,
}

#[derive(Debug, Default)]
pub struct FileStoreStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(root.join("entries")).await?;
        fs::create_dir_all(root.join("containers")).await?;

        Ok(Self {
            root,
            stats: FileStoreStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `entries/<shard>/<uuid>.json`; the two-character shard keeps
    /// directories small.
    fn entry_path(&self, key: &str) -> PathBuf {
        let name = file_stem(key);
        self.root
            .join("entries")
            .join(&name[..2])
            .join(format!("{name}.json"))
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.root
            .join("containers")
            .join(format!("{}.json", file_stem(id)))
    }

    pub fn stats(&self) -> &FileStoreStats {
        &self.stats
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path).await {
            Ok(data) => {
                self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        write_atomic(path, data).await?;
        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

fn file_stem(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
        .simple()
        .to_string()
}

/// Write `data` to `path` via a sibling temporary file and a rename. Each
/// call gets its own temporary file, so concurrent writers of one path
/// never share one.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = remove_if_exists(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Remove `path`, treating a missing file as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl PersistentTier for FileStore {
    async fn read(&self, key: &str) -> Result<Option<PersistedEntry>, StorageError> {
        let path = self.entry_path(key);
        let Some(data) = self.read_file(&path).await? else {
            return Ok(None);
        };
        let entry: PersistedEntry = serde_json::from_slice(&data)?;

        // Name collisions are astronomically unlikely; still never serve another key's value.
        if entry.key != key {
            debug!(key, stored = %entry.key, "Entry file belongs to a different key");
            return Ok(None);
        }

        debug!(key, path = %path.display(), size = data.len(), "Read entry from disk");
        Ok(Some(entry))
    }

    async fn write(&self, key: &str, entry: &PersistedEntry) -> Result<(), StorageError> {
        let path = self.entry_path(key);
        let data = serde_json::to_vec(entry)?;
        self.write_file(&path, &data).await?;
        debug!(key, path = %path.display(), size = data.len(), "Wrote entry to disk");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.entry_path(key);
        remove_if_exists(&path).await?;
        debug!(key, path = %path.display(), "Deleted entry file");
        Ok(())
    }

    async fn read_container(&self, id: &str) -> Result<Option<Container>, StorageError> {
        let path = self.container_path(id);
        match self.read_file(&path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn write_container(&self, container: &Container) -> Result<(), StorageError> {
        let path = self.container_path(&container.id);
        let data = serde_json::to_vec(container)?;
        self.write_file(&path, &data).await?;
        debug!(
            container = %container.id,
            items = container.items.len(),
            "Wrote container to disk"
        );
        Ok(())
    }
}
