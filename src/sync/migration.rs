//! Consistency coordinator: moves items between two containers so that
//! every item ends up in exactly one of them, even when the same move is
//! triggered twice.
//!
//! A move holds a lock on the unordered container pair for its duration.
//! A second move on the same pair is rejected immediately with
//! [`MigrationError::Busy`]; a lock older than the configured timeout is
//! considered abandoned and force-released by the next caller.
//!
//! Write order is source first, then destination. If the destination write
//! fails (or the move times out) the original lists are written back, so a
//! failed move leaves both containers as they were and can be retried.
//! When the write-back fails too, a [`WriteOp::RepairMove`] is queued. It
//! is replayed by the flusher, or by the next move touching either
//! container, before that move reads anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::entry::{Clock, SystemClock};
use crate::cache::metrics::CacheMetrics;
use crate::config::MigrationConfig;
use crate::storage::{Container, ContainerId, ItemId, PersistentTier, StorageError};
use crate::sync::write_queue::{DurableWriteQueue, WriteOp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Migration between {pair_key} already in progress")]
    Busy { pair_key: String },

    #[error("Cannot migrate container {0} into itself")]
    SameContainer(ContainerId),

    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("Storage failure on container {container}: {reason}")]
    Storage { container: ContainerId, reason: String },

    #[error("Migration between {pair_key} timed out after {timeout_ms}ms")]
    TimedOut { pair_key: String, timeout_ms: u64 },

    #[error("Unfinished rollback on {pair_key} could not be repaired: {reason}")]
    RepairPending { pair_key: String, reason: String },
}

impl MigrationError {
    fn storage(container: &str, e: StorageError) -> Self {
        MigrationError::Storage {
            container: container.to_string(),
            reason: e.to_string(),
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            MigrationError::Busy { .. } => "busy",
            MigrationError::TimedOut { .. } => "timed_out",
            _ => "failed",
        }
    }
}

/// Canonical key of an unordered container pair.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLock {
    pub pair_key: String,
    pub token: Uuid,
    pub acquired_at: u64,
    pub timeout_ms: u64,
}

impl MigrationLock {
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.acquired_at) > self.timeout_ms
    }
}

type LockTable = Arc<Mutex<HashMap<String, MigrationLock>>>;

/// Releases the pair lock on drop, provided it still owns it.
struct LockGuard {
    locks: LockTable,
    pair_key: String,
    token: Uuid,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        if locks.get(&self.pair_key).is_some_and(|l| l.token == self.token) {
            locks.remove(&self.pair_key);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub pair_key: String,
    /// Items removed from the source, in source order.
    pub moved: Vec<ItemId>,
    /// Moved items the destination already listed.
    pub already_present: Vec<ItemId>,
    /// Requested items the source did not hold.
    pub not_in_source: Vec<ItemId>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.moved.is_empty()
    }
}

struct Plan {
    source: Container,
    dest: Container,
    new_source: Container,
    new_dest: Container,
    report: MigrationReport,
}

impl Plan {
    /// Moved items the destination did not already list.
    fn added(&self) -> Vec<ItemId> {
        let already: HashSet<&str> = self.report.already_present.iter().map(String::as_str).collect();
        self.report
            .moved
            .iter()
            .filter(|item| !already.contains(item.as_str()))
            .cloned()
            .collect()
    }
}

pub struct ConsistencyCoordinator {
    durable: Arc<dyn PersistentTier>,
    locks: LockTable,
    config: MigrationConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<CacheMetrics>>,
    queue: Option<Arc<DurableWriteQueue>>,
}

impl ConsistencyCoordinator {
    pub fn new(durable: Arc<dyn PersistentTier>, config: MigrationConfig) -> Self {
        Self {
            durable,
            locks: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock: Arc::new(SystemClock),
            metrics: None,
            queue: None,
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

    /// Queue used to repair a container whose rollback could not be written.
    pub fn with_queue(mut self, queue: Arc<DurableWriteQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn is_locked(&self, a: &str, b: &str) -> bool {
        let now = self.clock.now_ms();
        self.locks
            .lock()
            .get(&pair_key(a, b))
            .is_some_and(|l| !l.is_expired(now))
    }

    pub fn active_locks(&self) -> usize {
        self.locks.lock().len()
    }

    fn try_acquire(&self, pair_key: &str) -> Result<LockGuard, MigrationError> {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();

        if let Some(existing) = locks.get(pair_key) {
            if !existing.is_expired(now) {
                return Err(MigrationError::Busy {
                    pair_key: pair_key.to_string(),
                });
            }
            warn!(
                pair_key,
                held_ms = now.saturating_sub(existing.acquired_at),
                "Force-releasing expired migration lock"
            );
        }

        let token = Uuid::new_v4();
        locks.insert(
            pair_key.to_string(),
            MigrationLock {
                pair_key: pair_key.to_string(),
                token,
                acquired_at: now,
                timeout_ms: self.config.lock_timeout_ms,
            },
        );
        Ok(LockGuard {
            locks: self.locks.clone(),
            pair_key: pair_key.to_string(),
            token,
        })
    }

    /// Move `items` from container `from` to container `to`.
    pub async fn migrate(
        &self,
        items: &[ItemId],
        from: &str,
        to: &str,
    ) -> Result<MigrationReport, MigrationError> {
        let result = self.migrate_inner(items, from, to).await;
        let outcome = match &result {
            Ok(report) if report.is_noop() => "noop",
            Ok(_) => "moved",
            Err(e) => e.outcome(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_migration(outcome);
        }
        result
    }

    async fn migrate_inner(
        &self,
        items: &[ItemId],
        from: &str,
        to: &str,
    ) -> Result<MigrationReport, MigrationError> {
        if from == to {
            return Err(MigrationError::SameContainer(from.to_string()));
        }
        let pair_key = pair_key(from, to);
        let _guard = self.try_acquire(&pair_key)?;
        debug!(pair_key = %pair_key, from, to, requested = items.len(), "Migration lock acquired");

        let timeout_ms = self.config.lock_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let timed_out = || MigrationError::TimedOut {
            pair_key: pair_key.clone(),
            timeout_ms,
        };

        tokio::time::timeout_at(deadline, self.settle_repairs(&pair_key, from, to))
            .await
            .map_err(|_| timed_out())??;

        let (source, dest) = tokio::time::timeout_at(deadline, self.load_pair(from, to))
            .await
            .map_err(|_| timed_out())??;

        let plan = plan(&pair_key, items, source, dest);
        if plan.report.is_noop() {
            debug!(pair_key = %pair_key, "Nothing to move");
            return Ok(plan.report);
        }

        match tokio::time::timeout_at(deadline, self.apply(&plan)).await {
            Ok(Ok(())) => {
                info!(
                    pair_key = %pair_key,
                    from,
                    to,
                    moved = plan.report.moved.len(),
                    already_present = plan.report.already_present.len(),
                    "Migration complete"
                );
                Ok(plan.report)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(pair_key = %pair_key, timeout_ms, "Migration timed out, restoring containers");
                let source_restored = self.restore(&plan.source).await;
                let dest_restored = self.restore(&plan.dest).await;
                if !(source_restored && dest_restored) {
                    self.queue_repair(&plan).await;
                }
                Err(timed_out())
            }
        }
    }

    async fn load_pair(&self, from: &str, to: &str) -> Result<(Container, Container), MigrationError> {
        let source = self
            .durable
            .read_container(from)
            .await
            .map_err(|e| MigrationError::storage(from, e))?
            .ok_or_else(|| MigrationError::ContainerNotFound(from.to_string()))?;
        let dest = self
            .durable
            .read_container(to)
            .await
            .map_err(|e| MigrationError::storage(to, e))?
            .ok_or_else(|| MigrationError::ContainerNotFound(to.to_string()))?;
        Ok((source, dest))
    }

    async fn apply(&self, plan: &Plan) -> Result<(), MigrationError> {
        self.durable
            .write_container(&plan.new_source)
            .await
            .map_err(|e| MigrationError::storage(&plan.source.id, e))?;

        if let Err(e) = self.durable.write_container(&plan.new_dest).await {
            warn!(container = %plan.dest.id, error = %e, "Destination write failed, rolling back source");
            if !self.restore(&plan.source).await {
                self.queue_repair(plan).await;
            }
            return Err(MigrationError::storage(&plan.dest.id, e));
        }
        Ok(())
    }

    /// Write `original` back. Returns whether it landed.
    async fn restore(&self, original: &Container) -> bool {
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let failure = match tokio::time::timeout(timeout, self.durable.write_container(original)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        warn!(container = %original.id, reason = %failure, "Container rollback failed");
        false
    }

    /// Queue the inverse of `plan` as a delta, so later moves of other
    /// items are kept when it is replayed.
    async fn queue_repair(&self, plan: &Plan) {
        let op = WriteOp::RepairMove {
            from: plan.source.id.clone(),
            to: plan.dest.id.clone(),
            items: plan.report.moved.clone(),
            added: plan.added(),
        };
        let pair_key = &plan.report.pair_key;
        match &self.queue {
            Some(queue) => match queue.enqueue(op).await {
                Ok(id) => warn!(pair_key = %pair_key, %id, "Container repair queued"),
                Err(e) => error!(pair_key = %pair_key, error = %e, "Container repair lost"),
            },
            None => error!(pair_key = %pair_key, "No write queue, containers left inconsistent"),
        }
    }

    /// Apply queued repairs touching `from` or `to` before a move reads
    /// either container. Repairs on another pair take that pair's lock.
    async fn settle_repairs(&self, pair_key: &str, from: &str, to: &str) -> Result<(), MigrationError> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        let pending = |reason: String| MigrationError::RepairPending {
            pair_key: pair_key.to_string(),
            reason,
        };

        let records = queue.dequeue_all().await.map_err(|e| pending(e.to_string()))?;
        for record in records {
            let WriteOp::RepairMove {
                from: repair_from,
                to: repair_to,
                items,
                added,
            } = &record.payload
            else {
                continue;
            };
            let touches = [repair_from, repair_to]
                .iter()
                .any(|id| id.as_str() == from || id.as_str() == to);
            if !touches {
                continue;
            }

            let repair_pair = self::pair_key(repair_from, repair_to);
            let _other = if repair_pair != pair_key {
                Some(self.try_acquire(&repair_pair)?)
            } else {
                None
            };
            repair_move(self.durable.as_ref(), repair_from, repair_to, items, added)
                .await
                .map_err(|e| pending(e.to_string()))?;
            queue
                .remove(record.id)
                .await
                .map_err(|e| pending(e.to_string()))?;
            info!(pair_key = %repair_pair, returned = items.len(), "Applied queued container repair");
        }
        Ok(())
    }

    /// Apply a queued repair under the pair lock.
    pub async fn replay_repair(
        &self,
        from: &str,
        to: &str,
        items: &[ItemId],
        added: &[ItemId],
    ) -> Result<(), MigrationError> {
        let pair_key = pair_key(from, to);
        let _guard = self.try_acquire(&pair_key)?;
        repair_move(self.durable.as_ref(), from, to, items, added)
            .await
            .map_err(|e| MigrationError::RepairPending {
                pair_key,
                reason: e.to_string(),
            })
    }
}

/// Put `items` back into `from` unless already listed, then drop `added`
/// from `to`. Unchanged containers are not rewritten.
pub async fn repair_move(
    durable: &dyn PersistentTier,
    from: &str,
    to: &str,
    items: &[ItemId],
    added: &[ItemId],
) -> Result<(), StorageError> {
    let missing = |id: &str| StorageError::Unavailable(format!("container {id} not found"));

    let mut source = durable.read_container(from).await?.ok_or_else(|| missing(from))?;
    let present: HashSet<&str> = source.items.iter().map(String::as_str).collect();
    let returned: Vec<ItemId> = items
        .iter()
        .filter(|item| !present.contains(item.as_str()))
        .cloned()
        .collect();
    if !returned.is_empty() {
        source.items.extend(returned);
        durable.write_container(&source).await?;
    }

    let mut dest = durable.read_container(to).await?.ok_or_else(|| missing(to))?;
    let withdraw: HashSet<&str> = added.iter().map(String::as_str).collect();
    let before = dest.items.len();
    dest.items.retain(|item| !withdraw.contains(item.as_str()));
    if dest.items.len() != before {
        durable.write_container(&dest).await?;
    }
    Ok(())
}

fn plan(pair_key: &str, items: &[ItemId], source: Container, dest: Container) -> Plan {
    let requested: HashSet<&str> = items.iter().map(String::as_str).collect();
    let dest_items: HashSet<&str> = dest.items.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let moved: Vec<ItemId> = source
        .items
        .iter()
        .filter(|item| requested.contains(item.as_str()) && seen.insert(item.as_str()))
        .cloned()
        .collect();
    let moving: HashSet<&str> = moved.iter().map(String::as_str).collect();

    let already_present: Vec<ItemId> = moved
        .iter()
        .filter(|item| dest_items.contains(item.as_str()))
        .cloned()
        .collect();

    let mut reported = HashSet::new();
    let not_in_source: Vec<ItemId> = items
        .iter()
        .filter(|item| !moving.contains(item.as_str()) && reported.insert(item.as_str()))
        .cloned()
        .collect();

    let new_source = Container::new(
        source.id.clone(),
        source
            .items
            .iter()
            .filter(|item| !moving.contains(item.as_str()))
            .cloned()
            .collect(),
    );
    let mut new_dest_items = dest.items.clone();
    new_dest_items.extend(
        moved
            .iter()
            .filter(|item| !dest_items.contains(item.as_str()))
            .cloned(),
    );
    let new_dest = Container::new(dest.id.clone(), new_dest_items);

    Plan {
        report: MigrationReport {
            pair_key: pair_key.to_string(),
            moved,
            already_present,
            not_in_source,
        },
        source,
        dest,
        new_source,
        new_dest,
    }
}
