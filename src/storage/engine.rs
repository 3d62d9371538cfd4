//! Storage engines behind the durable write queue.
//!
//! Engines are tried in order of capability, and a failing open (or a
//! failing operation later on) moves the queue to the next one:
//!
//! 1. [`DirectoryEngine`]: one file per record, no size limit beyond the disk
//! 2. [`SnapshotEngine`]: the whole queue in a single JSON file, size-capped
//! 3. [`MemoryEngine`]: a plain in-process list, lost on exit

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::disk::{remove_if_exists, write_atomic};
use crate::storage::StorageError;
use crate::sync::write_queue::QueuedWrite;

/// Which engine is backing the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Directory,
    Snapshot,
    Memory,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Directory => write!(f, "directory"),
            EngineKind::Snapshot => write!(f, "snapshot"),
            EngineKind::Memory => write!(f, "memory"),
        }
    }
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Insert or overwrite a record (keyed by `record.id`).
    async fn put(&self, record: &QueuedWrite) -> Result<(), StorageError>;

    async fn get_all(&self) -> Result<Vec<QueuedWrite>, StorageError>;

    async fn delete(&self, id: Uuid) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.get_all().await?.len())
    }
}

/// One JSON file per record in a directory.
pub struct DirectoryEngine {
    dir: PathBuf,
}

impl DirectoryEngine {
    /// Create the directory and prove it is writable.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let check = dir.join(".writable");
        fs::write(&check, b"ok").await?;
        remove_if_exists(&check).await?;

        Ok(Self { dir })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id.simple()))
    }
}

#[async_trait]
impl StorageEngine for DirectoryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Directory
    }

    async fn put(&self, record: &QueuedWrite) -> Result<(), StorageError> {
        let data = serde_json::to_vec(record)?;
        write_atomic(&self.record_path(record.id), &data).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QueuedWrite>, StorageError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<QueuedWrite>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed queued write"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        remove_if_exists(&self.record_path(id)).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                remove_if_exists(&path).await?;
            }
        }
        Ok(())
    }
}

/// The whole queue serialized into a single file, rewritten on every change.
pub struct SnapshotEngine {
    path: PathBuf,
    max_bytes: usize,
    // Serializes load-modify-store cycles.
    lock: tokio::sync::Mutex<()>,
}

impl SnapshotEngine {
    /// The snapshot must be readable (or creatable) and parse.
    pub async fn open(path: impl Into<PathBuf>, max_bytes: usize) -> Result<Self, StorageError> {
        let engine = Self {
            path: path.into(),
            max_bytes,
            lock: tokio::sync::Mutex::new(()),
        };
        match fs::read(&engine.path).await {
            Ok(data) => {
                serde_json::from_slice::<Vec<QueuedWrite>>(&data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                engine.store(&[]).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(engine)
    }

    async fn load(&self) -> Result<Vec<QueuedWrite>, StorageError> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, records: &[QueuedWrite]) -> Result<(), StorageError> {
        let data = serde_json::to_vec(records)?;
        if data.len() > self.max_bytes {
            return Err(StorageError::CapacityExceeded {
                needed: data.len(),
                limit: self.max_bytes,
            });
        }
        write_atomic(&self.path, &data).await?;
        debug!(path = %self.path.display(), records = records.len(), "Stored queue snapshot");
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for SnapshotEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Snapshot
    }

    async fn put(&self, record: &QueuedWrite) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.store(&records).await
    }

    async fn get_all(&self) -> Result<Vec<QueuedWrite>, StorageError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.retain(|r| r.id != id);
        self.store(&records).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.store(&[]).await
    }
}

/// Last resort: records live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    records: Mutex<Vec<QueuedWrite>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Memory
    }

    async fn put(&self, record: &QueuedWrite) -> Result<(), StorageError> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QueuedWrite>, StorageError> {
        Ok(self.records.lock().clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        self.records.lock().retain(|r| r.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.records.lock().clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.records.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::write_queue::WriteOp;
    use tempfile::TempDir;

    fn record(key: &str) -> QueuedWrite {
        QueuedWrite::new(WriteOp::DeleteEntry { key: key.into() }, 100, 3)
    }

    #[tokio::test]
    async fn test_directory_engine_put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let engine = DirectoryEngine::open(tmp.path().join("queue")).await.unwrap();

        let a = record("a");
        let b = record("b");
        engine.put(&a).await.unwrap();
        engine.put(&b).await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 2);

        engine.delete(a.id).await.unwrap();
        let all = engine.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, b.id);

        engine.clear().await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_directory_engine_put_overwrites() {
        let tmp = TempDir::new().unwrap();
        let engine = DirectoryEngine::open(tmp.path()).await.unwrap();

        let mut a = record("a");
        engine.put(&a).await.unwrap();
        a.retry_count = 2;
        engine.put(&a).await.unwrap();

        let all = engine.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_engine_enforces_size_limit() {
        let tmp = TempDir::new().unwrap();
        let engine = SnapshotEngine::open(tmp.path().join("queue.json"), 200)
            .await
            .unwrap();

        engine.put(&record("a")).await.unwrap();
        let err = engine.put(&record("b")).await.unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { .. }));
        assert_eq!(engine.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_engine_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.json");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(SnapshotEngine::open(&path, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_engine() {
        let engine = MemoryEngine::new();
        let a = record("a");
        engine.put(&a).await.unwrap();
        engine.put(&a).await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 1);
        engine.delete(a.id).await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 0);
    }
}
