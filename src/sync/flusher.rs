//! Flusher: replays queued writes against the durable tier.
//!
//! Writes are replayed oldest first. A replayed write is removed only
//! after the durable tier confirms it; a failed replay bumps the record's
//! retry count and is dropped once the count exceeds its budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::storage::{PersistentTier, StorageError};
use crate::sync::migration::{self, ConsistencyCoordinator};
use crate::sync::write_queue::{DurableWriteQueue, QueueError, QueuedWrite, WriteOp};

/// Outcome of one flush round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    /// Failed and kept for another round.
    pub failed: usize,
    /// Failed for the last time and discarded.
    pub dropped: usize,
    /// Skipped because a newer write already reached the durable tier.
    pub superseded: usize,
}

pub struct Flusher {
    queue: Arc<DurableWriteQueue>,
    durable: Arc<dyn PersistentTier>,
    migrations: Option<Arc<ConsistencyCoordinator>>,
}

impl Flusher {
    pub fn new(queue: Arc<DurableWriteQueue>, durable: Arc<dyn PersistentTier>) -> Self {
        Self {
            queue,
            durable,
            migrations: None,
        }
    }

    /// Replay container repairs under the coordinator's pair lock.
    pub fn with_migrations(mut self, migrations: Arc<ConsistencyCoordinator>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    pub async fn flush_once(&self) -> Result<FlushReport, QueueError> {
        let records = self.queue.dequeue_all().await?;
        let mut report = FlushReport::default();
        if records.is_empty() {
            self.queue.record_flush(true);
            return Ok(report);
        }

        for record in records {
            match self.replay(&record).await {
                Ok(Replay::Applied) => {
                    self.queue.remove(record.id).await?;
                    report.flushed += 1;
                }
                Ok(Replay::Superseded) => {
                    debug!(id = %record.id, target_key = record.payload.target(), "Queued write superseded");
                    self.queue.remove(record.id).await?;
                    report.superseded += 1;
                }
                Err(e) => {
                    warn!(
                        id = %record.id,
                        target_key = record.payload.target(),
                        retries = record.retry_count,
                        error = %e,
                        "Replay failed"
                    );
                    if self.queue.record_failure(record).await? {
                        report.dropped += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        self.queue.record_flush(report.failed == 0 && report.dropped == 0);
        info!(
            flushed = report.flushed,
            superseded = report.superseded,
            failed = report.failed,
            dropped = report.dropped,
            "Flush round complete"
        );
        Ok(report)
    }

    async fn replay(&self, record: &QueuedWrite) -> Result<Replay, StorageError> {
        match &record.payload {
            WriteOp::PutEntry { key, entry } => {
                if self.newer_on_disk(key, entry.stored_at).await? {
                    return Ok(Replay::Superseded);
                }
                self.durable.write(key, entry).await?;
            }
            WriteOp::DeleteEntry { key } => {
                if self.newer_on_disk(key, record.enqueued_at).await? {
                    return Ok(Replay::Superseded);
                }
                self.durable.delete(key).await?;
            }
            WriteOp::RepairMove {
                from,
                to,
                items,
                added,
            } => match &self.migrations {
                Some(migrations) => migrations
                    .replay_repair(from, to, items, added)
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?,
                None => migration::repair_move(self.durable.as_ref(), from, to, items, added).await?,
            },
        }
        Ok(Replay::Applied)
    }

    async fn newer_on_disk(&self, key: &str, than: u64) -> Result<bool, StorageError> {
        Ok(self
            .durable
            .read(key)
            .await?
            .is_some_and(|current| current.stored_at > than))
    }

    /// Flush every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        warn!(error = %e, "Flush round aborted");
                        self.queue.record_flush(false);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Flusher stopping");
                        return;
                    }
                }
            }
        }
    }
}

enum Replay {
    Applied,
    Superseded,
}
