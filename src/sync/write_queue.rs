//! Durable write queue: writes the durable tier could not take right now,
//! held until the flusher replays them.
//!
//! The queue sits on a chain of storage engines, most capable first. A
//! failing engine is abandoned for the rest of the process and the
//! operation is retried on the next one; the in-memory engine at the end
//! of the chain never fails.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::entry::{Clock, PersistedEntry, SystemClock};
use crate::cache::metrics::CacheMetrics;
use crate::config::QueueConfig;
use crate::storage::engine::{DirectoryEngine, EngineKind, MemoryEngine, SnapshotEngine, StorageEngine};
use crate::storage::{ContainerId, ItemId, StorageError};

/// A durable-tier write to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    PutEntry { key: String, entry: PersistedEntry },
    DeleteEntry { key: String },
    /// Undo a move whose rollback could not be written: put `items` back
    /// into `from` and take `added` out of `to`. Applying it twice is
    /// harmless.
    RepairMove {
        from: ContainerId,
        to: ContainerId,
        items: Vec<ItemId>,
        added: Vec<ItemId>,
    },
}

impl WriteOp {
    /// Key or container id the write targets.
    pub fn target(&self) -> &str {
        match self {
            WriteOp::PutEntry { key, .. } | WriteOp::DeleteEntry { key } => key,
            WriteOp::RepairMove { from, .. } => from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: Uuid,
    pub payload: WriteOp,
    pub enqueued_at: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedWrite {
    pub fn new(payload: WriteOp, enqueued_at: u64, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Write queue is full ({max_size} pending)")]
    Full { max_size: usize },

    #[error("Write queue storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Flush bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub last_attempt_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub pending: usize,
    pub engine: EngineKind,
}

struct EngineChain {
    engines: Vec<Box<dyn StorageEngine>>,
    active: usize,
}

impl EngineChain {
    fn kind(&self) -> EngineKind {
        self.engines
            .get(self.active)
            .map(|e| e.kind())
            .unwrap_or(EngineKind::Memory)
    }

    /// Run `f` on the active engine, demoting to the next engine on failure.
    async fn run<T, F>(&mut self, operation: &'static str, f: F) -> Result<T, QueueError>
    where
        F: for<'e> Fn(&'e dyn StorageEngine) -> BoxFuture<'e, Result<T, StorageError>>,
    {
        loop {
            let Some(engine) = self.engines.get(self.active) else {
                return Err(StorageError::Unavailable("no queue engine".into()).into());
            };
            let failed = engine.kind();
            let result = f(engine.as_ref()).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if self.active + 1 < self.engines.len() => {
                    warn!(
                        operation,
                        from = %failed,
                        to = %self.engines[self.active + 1].kind(),
                        error = %e,
                        "Write queue engine failed, falling back"
                    );
                    self.demote().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Switch to the next engine, carrying over whatever the abandoned
    /// engine can still list.
    async fn demote(&mut self) {
        let from = self.active;
        self.active += 1;
        let stranded = match self.engines[from].get_all().await {
            Ok(records) => records,
            Err(e) => {
                error!(engine = %self.engines[from].kind(), error = %e, "Queued writes in failed engine are unreadable");
                return;
            }
        };
        if stranded.is_empty() {
            return;
        }
        let carried = self.absorb(from, stranded).await;
        info!(carried, to = %self.kind(), "Carried queued writes to fallback engine");
    }

    /// Move engines below the active one into it. Run once at open, so a
    /// fallback used during an earlier run is replayed once the preferred
    /// engine works again.
    async fn absorb_lower(&self) -> usize {
        let mut recovered = 0;
        for index in self.active + 1..self.engines.len() {
            let records = match self.engines[index].get_all().await {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => records,
                Err(e) => {
                    warn!(engine = %self.engines[index].kind(), error = %e, "Could not read fallback queue engine");
                    continue;
                }
            };
            recovered += self.absorb(index, records).await;
        }
        recovered
    }

    /// Put `records` from engine `from` into the active engine and clear
    /// `from` once every record has landed. Returns the number moved.
    async fn absorb(&self, from: usize, records: Vec<QueuedWrite>) -> usize {
        let Some(target) = self.engines.get(self.active) else {
            return 0;
        };
        let mut moved = 0;
        for record in &records {
            if let Err(e) = target.put(record).await {
                warn!(engine = %target.kind(), error = %e, moved, "Could not carry queued writes over");
                return moved;
            }
            moved += 1;
        }
        if let Err(e) = self.engines[from].clear().await {
            warn!(engine = %self.engines[from].kind(), error = %e, "Carried writes remain in the old engine");
        }
        moved
    }
}

pub struct DurableWriteQueue {
    chain: tokio::sync::Mutex<EngineChain>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    status: Mutex<SyncStatus>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl DurableWriteQueue {
    /// Open the engines under `data_dir` in order of capability. Every
    /// engine that opens joins the chain; the in-memory engine always does.
    pub async fn open(config: QueueConfig, data_dir: &Path) -> Self {
        let mut engines: Vec<Box<dyn StorageEngine>> = Vec::new();

        match DirectoryEngine::open(data_dir.join("queue")).await {
            Ok(engine) => engines.push(Box::new(engine)),
            Err(e) => warn!(error = %e, "Directory queue engine unavailable"),
        }
        match SnapshotEngine::open(data_dir.join("queue.json"), config.snapshot_max_bytes).await {
            Ok(engine) => engines.push(Box::new(engine)),
            Err(e) => warn!(error = %e, "Snapshot queue engine unavailable"),
        }
        engines.push(Box::new(MemoryEngine::new()));

        let queue = Self::with_engines(config, engines);
        let recovered = queue.chain.lock().await.absorb_lower().await;
        info!(engine = %queue.engine_kind().await, recovered, "Durable write queue ready");
        queue
    }

    /// Build on an explicit engine chain, most capable first.
    pub fn with_engines(config: QueueConfig, engines: Vec<Box<dyn StorageEngine>>) -> Self {
        let engine = engines.first().map(|e| e.kind()).unwrap_or(EngineKind::Memory);
        Self {
            chain: tokio::sync::Mutex::new(EngineChain { engines, active: 0 }),
            config,
            clock: Arc::new(SystemClock),
            status: Mutex::new(SyncStatus {
                last_attempt_at: None,
                last_success_at: None,
                pending: 0,
                engine,
            }),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn engine_kind(&self) -> EngineKind {
        self.chain.lock().await.kind()
    }

    fn note_depth(&self, pending: usize, engine: EngineKind) {
        {
            let mut status = self.status.lock();
            status.pending = pending;
            status.engine = engine;
        }
        if let Some(metrics) = &self.metrics {
            metrics.queue_depth.set(pending as i64);
        }
    }

    /// Append a write. Rejected once `max_size` writes are pending.
    pub async fn enqueue(&self, payload: WriteOp) -> Result<Uuid, QueueError> {
        let mut chain = self.chain.lock().await;
        let count = chain.run("count", |engine| engine.count()).await?;
        if count >= self.config.max_size {
            warn!(target_key = payload.target(), max_size = self.config.max_size, "Write queue full");
            return Err(QueueError::Full {
                max_size: self.config.max_size,
            });
        }

        let record = QueuedWrite::new(payload, self.clock.now_ms(), self.config.max_retries);
        chain
            .run("put", |engine| {
                let record = record.clone();
                Box::pin(async move { engine.put(&record).await })
            })
            .await?;

        debug!(id = %record.id, target_key = record.payload.target(), pending = count + 1, "Enqueued write");
        self.note_depth(count + 1, chain.kind());
        Ok(record.id)
    }

    /// Every pending write, oldest first.
    pub async fn dequeue_all(&self) -> Result<Vec<QueuedWrite>, QueueError> {
        let mut chain = self.chain.lock().await;
        let mut records = chain.run("get_all", |engine| engine.get_all()).await?;
        records.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        self.note_depth(records.len(), chain.kind());
        Ok(records)
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let mut chain = self.chain.lock().await;
        chain.run("delete", |engine| engine.delete(id)).await?;
        let count = chain.run("count", |engine| engine.count()).await?;
        self.note_depth(count, chain.kind());
        Ok(())
    }

    /// Drop pending entry writes for `key` made at or before `not_after`.
    /// Called once a write or delete of the key made at `not_after` has
    /// reached the durable tier, so a replay can not undo it. Returns how
    /// many were dropped.
    pub async fn discard_entry_writes(&self, key: &str, not_after: u64) -> Result<usize, QueueError> {
        let mut chain = self.chain.lock().await;
        let records = chain.run("get_all", |engine| engine.get_all()).await?;
        let stale: Vec<Uuid> = records
            .iter()
            .filter(|r| match &r.payload {
                WriteOp::PutEntry { key: k, entry } => k == key && entry.stored_at <= not_after,
                WriteOp::DeleteEntry { key: k } => k == key && r.enqueued_at <= not_after,
                _ => false,
            })
            .map(|r| r.id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        for id in &stale {
            let id = *id;
            chain.run("delete", |engine| engine.delete(id)).await?;
        }
        let pending = records.len() - stale.len();
        debug!(key, dropped = stale.len(), pending, "Discarded superseded queued writes");
        self.note_depth(pending, chain.kind());
        Ok(stale.len())
    }

    pub async fn count(&self) -> Result<usize, QueueError> {
        let mut chain = self.chain.lock().await;
        chain.run("count", |engine| engine.count()).await
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut chain = self.chain.lock().await;
        chain.run("clear", |engine| engine.clear()).await?;
        self.note_depth(0, chain.kind());
        info!("Write queue cleared");
        Ok(())
    }

    /// Count a failed replay. Returns true if the write exceeded its retry
    /// budget and was dropped.
    pub async fn record_failure(&self, mut record: QueuedWrite) -> Result<bool, QueueError> {
        record.retry_count += 1;
        if record.exhausted() {
            error!(
                id = %record.id,
                target_key = record.payload.target(),
                retries = record.retry_count,
                "Dropping queued write after exhausting retries"
            );
            self.remove(record.id).await?;
            return Ok(true);
        }

        let mut chain = self.chain.lock().await;
        chain
            .run("put", |engine| {
                let record = record.clone();
                Box::pin(async move { engine.put(&record).await })
            })
            .await?;
        debug!(id = %record.id, retries = record.retry_count, "Queued write will be retried");
        Ok(false)
    }

    /// Record the outcome of a flush round.
    pub fn record_flush(&self, success: bool) {
        let now = self.clock.now_ms();
        let mut status = self.status.lock();
        status.last_attempt_at = Some(now);
        if success {
            status.last_success_at = Some(now);
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        *self.status.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn config(max_size: usize) -> QueueConfig {
        QueueConfig {
            max_size,
            ..QueueConfig::default()
        }
    }

    fn delete(key: &str) -> WriteOp {
        WriteOp::DeleteEntry { key: key.into() }
    }

    struct BrokenEngine;

    #[async_trait]
    impl StorageEngine for BrokenEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Directory
        }
        async fn put(&self, _record: &QueuedWrite) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn get_all(&self) -> Result<Vec<QueuedWrite>, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn delete(&self, _id: Uuid) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn clear(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn test_open_prefers_directory_engine() {
        let tmp = TempDir::new().unwrap();
        let queue = DurableWriteQueue::open(config(10), tmp.path()).await;
        assert_eq!(queue.engine_kind().await, EngineKind::Directory);
    }

    #[tokio::test]
    async fn test_failing_engine_demotes_and_retries() {
        let queue = DurableWriteQueue::with_engines(
            config(10),
            vec![Box::new(BrokenEngine), Box::new(MemoryEngine::new())],
        );
        queue.enqueue(delete("a")).await.unwrap();
        assert_eq!(queue.engine_kind().await, EngineKind::Memory);
        assert_eq!(queue.count().await.unwrap(), 1);
        assert_eq!(queue.sync_status().engine, EngineKind::Memory);
    }

    #[tokio::test]
    async fn test_last_engine_failure_surfaces() {
        let queue = DurableWriteQueue::with_engines(config(10), vec![Box::new(BrokenEngine)]);
        let err = queue.enqueue(delete("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
    }

    #[tokio::test]
    async fn test_dequeue_all_is_oldest_first() {
        let clock = Arc::new(crate::cache::entry::ManualClock::new(10));
        let queue = DurableWriteQueue::with_engines(config(10), vec![Box::new(MemoryEngine::new())])
            .with_clock(clock.clone());
        let first = queue.enqueue(delete("a")).await.unwrap();
        clock.advance(5);
        let second = queue.enqueue(delete("b")).await.unwrap();

        let all = queue.dequeue_all().await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_record_failure_drops_after_max_retries() {
        let queue = DurableWriteQueue::with_engines(
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
            vec![Box::new(MemoryEngine::new())],
        );
        queue.enqueue(delete("a")).await.unwrap();

        let record = queue.dequeue_all().await.unwrap().remove(0);
        assert!(!queue.record_failure(record).await.unwrap());
        let record = queue.dequeue_all().await.unwrap().remove(0);
        assert_eq!(record.retry_count, 1);
        assert!(queue.record_failure(record).await.unwrap());
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_keeps_newer_and_other_writes() {
        let clock = Arc::new(crate::cache::entry::ManualClock::new(10));
        let queue = DurableWriteQueue::with_engines(config(10), vec![Box::new(MemoryEngine::new())])
            .with_clock(clock.clone());
        queue.enqueue(delete("a")).await.unwrap();
        queue.enqueue(delete("b")).await.unwrap();
        clock.advance(100);
        let newer = queue.enqueue(delete("a")).await.unwrap();

        assert_eq!(queue.discard_entry_writes("a", 50).await.unwrap(), 1);
        let left = queue.dequeue_all().await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|r| r.id == newer));
        assert_eq!(queue.sync_status().pending, 2);
    }

    #[tokio::test]
    async fn test_sync_status_tracks_flushes() {
        let queue = DurableWriteQueue::with_engines(config(10), vec![Box::new(MemoryEngine::new())]);
        queue.record_flush(false);
        let status = queue.sync_status();
        assert!(status.last_attempt_at.is_some());
        assert!(status.last_success_at.is_none());

        queue.record_flush(true);
        assert!(queue.sync_status().last_success_at.is_some());
    }
}
