//! Tiered cache store: memory → local durable tier → origin.
//!
//! The store is the central owner of cache entries. It:
//! - serves reads from the fastest tier holding a valid entry, writing
//!   through into the faster tiers on the way back
//! - validates entries lazily against their policy (TTL + invalidation
//!   rules) and deletes failures from the tier they were found in
//! - enforces per-policy and global memory budgets in-line after each write
//! - hands durable writes it cannot complete to the durable write queue
//!
//! Ordering between reads and writes of the same key is kept with a
//! per-key mutation sequence: a lower-tier read that started before a
//! `set`/`delete` of the key never installs its (older) value over it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::codec::Codec;
use crate::cache::entry::{CacheEntry, Clock, PersistedEntry, SystemClock, Tier};
use crate::cache::evictor::Evictor;
use crate::cache::metrics::CacheMetrics;
use crate::cache::origin::OriginProvider;
use crate::cache::policy::{CachePolicy, InvalidationSignals, PolicyRegistry, Validation};
use crate::cache::CacheValue;
use crate::config::{CompressionConfig, StoreConfig};
use crate::storage::PersistentTier;
use crate::sync::write_queue::{DurableWriteQueue, QueueError, WriteOp};

/// Errors surfaced by store operations. A plain miss is `Ok(None)`, not an
/// error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown cache policy: {0}")]
    UnknownPolicy(String),

    #[error("Origin fetch failed for {key}: {reason}")]
    Origin { key: String, reason: String },

    #[error("Could not encode value for {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Write for {key} was not persisted and the write queue is full")]
    QueueFull { key: String },

    #[error("Write for {key} was not persisted: {reason}")]
    Unpersisted { key: String, reason: String },

    #[error("Fetch for {key} did not complete: {reason}")]
    Internal { key: String, reason: String },
}

/// A successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<V> {
    pub value: V,
    /// Tier that answered.
    pub source: Tier,
    /// Served although a degrade-to-stale rule matched.
    pub stale: bool,
    /// A refresh rule forced this read past the cached tiers.
    pub refreshed: bool,
    pub policy_name: String,
}

/// Memory-tier usage snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub policy_bytes: HashMap<String, usize>,
}

/// A set or delete of a key, kept while a lower-tier read of the key is
/// open so the read can re-apply it over anything it wrote.
#[derive(Debug, Clone)]
enum Mutation {
    Put(PersistedEntry),
    Delete { at: u64 },
}

#[derive(Debug, Default)]
struct PendingRead {
    readers: usize,
    last_mutation: Option<(u64, Mutation)>,
}

/// The memory tier plus its accounting. Only ever touched under the
/// store's mutex.
struct MemoryTier<V> {
    entries: HashMap<String, CacheEntry<V>>,
    policy_bytes: HashMap<String, usize>,
    total_bytes: usize,
    next_seq: u64,
    /// Keys with a lower-tier read in progress.
    pending: HashMap<String, PendingRead>,
}

impl<V> MemoryTier<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            policy_bytes: HashMap::new(),
            total_bytes: 0,
            next_seq: 0,
            pending: HashMap::new(),
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a set/delete of `key`, returning its sequence number.
    fn note_mutation(&mut self, key: &str, mutation: impl FnOnce() -> Mutation) -> u64 {
        let seq = self.bump_seq();
        if let Some(pending) = self.pending.get_mut(key) {
            pending.last_mutation = Some((seq, mutation()));
        }
        seq
    }

    /// The latest set/delete of `key` since `snapshot`, if any.
    fn mutated_since(&self, key: &str, snapshot: u64) -> Option<Mutation> {
        self.pending
            .get(key)
            .and_then(|pending| pending.last_mutation.as_ref())
            .filter(|(seq, _)| *seq >= snapshot)
            .map(|(_, mutation)| mutation.clone())
    }

    fn begin_read(&mut self, key: &str) -> u64 {
        self.pending.entry(key.to_string()).or_default().readers += 1;
        self.next_seq
    }

    /// Finish a lower-tier read, returning the latest set/delete of the
    /// key since the read began.
    fn end_read(&mut self, key: &str, snapshot: u64) -> Option<Mutation> {
        let mutation = self.mutated_since(key, snapshot);
        if let Some(pending) = self.pending.get_mut(key) {
            pending.readers = pending.readers.saturating_sub(1);
            if pending.readers == 0 {
                self.pending.remove(key);
            }
        }
        mutation
    }

    fn insert(&mut self, entry: CacheEntry<V>) {
        *self.policy_bytes.entry(entry.policy_name.clone()).or_default() += entry.size_bytes;
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.account_removed(&old);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let removed = self.entries.remove(key)?;
        self.account_removed(&removed);
        Some(removed)
    }

    fn account_removed(&mut self, entry: &CacheEntry<V>) {
        if let Some(bytes) = self.policy_bytes.get_mut(&entry.policy_name) {
            *bytes = bytes.saturating_sub(entry.size_bytes);
            if *bytes == 0 {
                self.policy_bytes.remove(&entry.policy_name);
            }
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
    }

    fn policy_bytes(&self, policy: &str) -> usize {
        self.policy_bytes.get(policy).copied().unwrap_or(0)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.policy_bytes.clear();
        self.total_bytes = 0;
    }
}

/// A lower-tier read in progress. Dropping it without installing (miss,
/// error, cancelled caller) still closes the read.
struct PendingReadGuard<'a, V> {
    memory: &'a Mutex<MemoryTier<V>>,
    key: String,
    snapshot: u64,
    finished: bool,
}

impl<V> Drop for PendingReadGuard<'_, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.memory.lock().end_read(&self.key, self.snapshot);
        }
    }
}

enum MemoryRead<V> {
    Hit(Lookup<V>),
    /// Not served from memory; `refresh` when a refresh rule fired.
    Miss { refresh: bool, snapshot: u64 },
}

enum DurableRead<V> {
    Hit(Lookup<V>),
    Miss { refresh: bool },
}

/// Collaborators a store is built from.
pub struct StoreParts<V> {
    pub durable: Arc<dyn PersistentTier>,
    pub origin: Arc<dyn OriginProvider<V>>,
    pub metrics: Arc<CacheMetrics>,
    pub registry: Arc<PolicyRegistry>,
    pub clock: Arc<dyn Clock>,
    pub signals: Option<Arc<InvalidationSignals>>,
    pub queue: Option<Arc<DurableWriteQueue>>,
    pub compression: CompressionConfig,
}

impl<V> StoreParts<V> {
    /// Default registry, system clock, no write queue.
    pub fn new(
        durable: Arc<dyn PersistentTier>,
        origin: Arc<dyn OriginProvider<V>>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            durable,
            origin,
            metrics,
            registry: Arc::new(PolicyRegistry::with_defaults()),
            clock: Arc::new(SystemClock),
            signals: None,
            queue: None,
            compression: CompressionConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_signals(mut self, signals: Arc<InvalidationSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_queue(mut self, queue: Arc<DurableWriteQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }
}

/// The tiered store.
pub struct TieredStore<V> {
    memory: Mutex<MemoryTier<V>>,
    durable: Arc<dyn PersistentTier>,
    origin: Arc<dyn OriginProvider<V>>,
    registry: Arc<PolicyRegistry>,
    signals: Arc<InvalidationSignals>,
    codec: Codec,
    evictor: Evictor,
    clock: Arc<dyn Clock>,
    queue: Option<Arc<DurableWriteQueue>>,
    metrics: Arc<CacheMetrics>,
    config: StoreConfig,
}

impl<V: CacheValue> TieredStore<V> {
    pub fn new(config: StoreConfig, parts: StoreParts<V>) -> Self {
        let signals = parts
            .signals
            .unwrap_or_else(|| Arc::new(InvalidationSignals::new(parts.clock.clone())));

        Self {
            memory: Mutex::new(MemoryTier::new()),
            durable: parts.durable,
            origin: parts.origin,
            registry: parts.registry,
            signals,
            codec: Codec::new(parts.compression),
            evictor: Evictor::new(),
            clock: parts.clock,
            queue: parts.queue,
            metrics: parts.metrics,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn signals(&self) -> &Arc<InvalidationSignals> {
        &self.signals
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn default_policy(&self) -> &str {
        &self.config.default_policy
    }

    fn policy(&self, name: &str) -> Result<Arc<CachePolicy>, StoreError> {
        self.registry
            .get(name)
            .ok_or_else(|| StoreError::UnknownPolicy(name.to_string()))
    }

    /// Read `key`; values fetched from the origin are stored under the
    /// default policy.
    pub async fn get(&self, key: &str) -> Result<Option<Lookup<V>>, StoreError> {
        let policy = self.config.default_policy.clone();
        self.get_with_policy(key, &policy).await
    }

    /// Read `key`; a value fetched from the origin is stored under `policy_name`.
    pub async fn get_with_policy(
        &self,
        key: &str,
        policy_name: &str,
    ) -> Result<Option<Lookup<V>>, StoreError> {
        let started = Instant::now();
        let result = self.lookup(key, policy_name).await;
        self.metrics
            .get_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn lookup(&self, key: &str, policy_name: &str) -> Result<Option<Lookup<V>>, StoreError> {
        let origin_policy = self.policy(policy_name)?;
        let now = self.clock.now_ms();

        let (mut refresh, snapshot) = match self.read_memory(key, now) {
            MemoryRead::Hit(lookup) => return Ok(Some(lookup)),
            MemoryRead::Miss { refresh, snapshot } => (refresh, snapshot),
        };
        let mut guard = PendingReadGuard {
            memory: &self.memory,
            key: key.to_string(),
            snapshot,
            finished: false,
        };

        if !refresh {
            match self.read_durable(key, now, &mut guard).await {
                DurableRead::Hit(lookup) => return Ok(Some(lookup)),
                DurableRead::Miss { refresh: r } => refresh = r,
            }
        }

        self.read_origin(key, &origin_policy, refresh, &mut guard).await
    }

    /// Memory lookup. On a miss the key is registered as pending in the same
    /// critical section, so any later set/delete is seen by the install.
    fn read_memory(&self, key: &str, now: u64) -> MemoryRead<V> {
        let mut mem = self.memory.lock();
        let mut refresh = false;

        if let Some(entry) = mem.entries.get_mut(key) {
            let validation = match self.registry.get(&entry.policy_name) {
                Some(policy) => self.signals.validate(&policy, entry.stored_at, now),
                None => Validation::Invalid { refresh: false },
            };

            match validation {
                Validation::Fresh | Validation::Stale => {
                    let stale = validation == Validation::Stale;
                    entry.touch();
                    let lookup = Lookup {
                        value: entry.value.clone(),
                        source: Tier::Memory,
                        stale,
                        refreshed: false,
                        policy_name: entry.policy_name.clone(),
                    };
                    self.metrics.record_hit(Tier::Memory);
                    if stale {
                        self.metrics.stale_served_total.inc();
                    }
                    return MemoryRead::Hit(lookup);
                }
                Validation::Invalid { refresh: r } => {
                    debug!(key, refresh = r, tier = %Tier::Memory, "Entry failed validation");
                    mem.remove(key);
                    self.metrics.memory_bytes.set(mem.total_bytes as i64);
                    refresh = r;
                }
            }
        }

        let snapshot = mem.begin_read(key);
        MemoryRead::Miss { refresh, snapshot }
    }

    async fn read_durable(
        &self,
        key: &str,
        now: u64,
        guard: &mut PendingReadGuard<'_, V>,
    ) -> DurableRead<V> {
        let persisted = match self.durable.read(key).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return DurableRead::Miss { refresh: false },
            Err(e) => {
                warn!(key, error = %e, "Durable tier read failed, falling through to origin");
                self.metrics.durable_errors_total.inc();
                return DurableRead::Miss { refresh: false };
            }
        };

        let Some(policy) = self.registry.get(&persisted.policy_name) else {
            debug!(key, policy = %persisted.policy_name, "Durable entry references unknown policy");
            self.delete_durable_quietly(key).await;
            return DurableRead::Miss { refresh: false };
        };

        let validation = self.signals.validate(&policy, persisted.stored_at, now);
        if let Validation::Invalid { refresh } = validation {
            debug!(key, refresh, tier = %Tier::Durable, "Entry failed validation");
            self.delete_durable_quietly(key).await;
            return DurableRead::Miss { refresh };
        }

        let mut entry: CacheEntry<V> = match self.codec.decode(&persisted) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Undecodable durable entry dropped");
                self.delete_durable_quietly(key).await;
                return DurableRead::Miss { refresh: false };
            }
        };
        entry.touch();

        let stale = validation == Validation::Stale;
        let lookup = Lookup {
            value: entry.value.clone(),
            source: Tier::Durable,
            stale,
            refreshed: false,
            policy_name: entry.policy_name.clone(),
        };

        self.install(guard, entry, &policy);
        self.metrics.record_hit(Tier::Durable);
        if stale {
            self.metrics.stale_served_total.inc();
        }
        DurableRead::Hit(lookup)
    }

    async fn read_origin(
        &self,
        key: &str,
        policy: &CachePolicy,
        refreshed: bool,
        guard: &mut PendingReadGuard<'_, V>,
    ) -> Result<Option<Lookup<V>>, StoreError> {
        self.metrics.origin_fetches_total.inc();
        debug!(key, policy = %policy.name, refreshed, "Fetching from origin");

        let value = match self.origin.fetch(key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.metrics.misses_total.inc();
                debug!(key, "Miss in every tier");
                return Ok(None);
            }
            Err(e) => {
                self.metrics.origin_errors_total.inc();
                warn!(key, error = %e, "Origin fetch failed");
                return Err(StoreError::Origin {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.metrics.record_hit(Tier::Origin);

        let mut entry = CacheEntry::new(
            key.to_string(),
            value.clone(),
            policy.name.clone(),
            self.clock.now_ms(),
            0,
        );
        let persisted = self.codec.encode(&entry).map_err(|e| StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        entry.size_bytes = persisted.size_bytes;

        let installed = {
            let mut mem = self.memory.lock();
            if mem.mutated_since(key, guard.snapshot).is_some() {
                guard.finished = true;
                mem.end_read(key, guard.snapshot);
                false
            } else {
                entry.seq = mem.bump_seq();
                mem.insert(entry);
                self.enforce_budgets(&mut mem, policy);
                true
            }
        };

        if installed {
            // The read stays open across the durable write, so a set or
            // delete landing meanwhile is seen and re-applied on top.
            if let Err(e) = self.persist(key, persisted).await {
                warn!(key, error = %e, "Origin value cached in memory only");
            }
            let raced = {
                let mut mem = self.memory.lock();
                guard.finished = true;
                mem.end_read(key, guard.snapshot)
            };
            if let Some(mutation) = raced {
                debug!(key, "Key written during durable write-through; re-applying");
                if let Err(e) = self.reapply(key, mutation).await {
                    warn!(key, error = %e, "Could not re-apply write over fetched value");
                }
            }
        } else {
            debug!(key, "Key written during origin fetch; fetched value not cached");
        }

        Ok(Some(Lookup {
            value,
            source: Tier::Origin,
            stale: false,
            refreshed,
            policy_name: policy.name.clone(),
        }))
    }

    /// Write a lower-tier value into memory unless the key was set or
    /// deleted since the read began. Returns whether it was installed.
    fn install(&self, guard: &mut PendingReadGuard<'_, V>, mut entry: CacheEntry<V>, policy: &CachePolicy) -> bool {
        let mut mem = self.memory.lock();
        guard.finished = true;
        if mem.end_read(&guard.key, guard.snapshot).is_some() {
            return false;
        }
        entry.seq = mem.bump_seq();
        mem.insert(entry);
        self.enforce_budgets(&mut mem, policy);
        true
    }

    /// Store `value` under `policy_name` in memory and the durable tier.
    pub async fn set(&self, key: &str, value: V, policy_name: &str) -> Result<(), StoreError> {
        let policy = self.policy(policy_name)?;

        let mut entry = CacheEntry::new(
            key.to_string(),
            value,
            policy.name.clone(),
            self.clock.now_ms(),
            0,
        );
        let persisted = self.codec.encode(&entry).map_err(|e| StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        entry.size_bytes = persisted.size_bytes;

        {
            let mut mem = self.memory.lock();
            entry.seq = mem.note_mutation(key, || Mutation::Put(persisted.clone()));
            mem.insert(entry);
            self.enforce_budgets(&mut mem, &policy);
        }
        debug!(key, policy = %policy.name, size = persisted.size_bytes, "Stored entry");

        let stored_at = persisted.stored_at;
        if self.persist(key, persisted).await? {
            self.discard_queued(key, stored_at).await;
        }
        Ok(())
    }

    /// Remove `key` from memory and the durable tier. Returns whether the
    /// memory tier held it.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let at = self.clock.now_ms();
        let existed = {
            let mut mem = self.memory.lock();
            mem.note_mutation(key, || Mutation::Delete { at });
            let existed = mem.remove(key).is_some();
            self.metrics.memory_bytes.set(mem.total_bytes as i64);
            existed
        };

        self.delete_durable(key, at).await?;
        Ok(existed)
    }

    async fn delete_durable(&self, key: &str, at: u64) -> Result<(), StoreError> {
        match self.durable.delete(key).await {
            Ok(()) => {
                self.discard_queued(key, at).await;
                Ok(())
            }
            Err(e) => {
                warn!(key, error = %e, "Durable delete failed, queueing");
                self.metrics.durable_errors_total.inc();
                self.enqueue(key, WriteOp::DeleteEntry { key: key.to_string() })
                    .await
            }
        }
    }

    async fn reapply(&self, key: &str, mutation: Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::Put(persisted) => {
                let stored_at = persisted.stored_at;
                if self.persist(key, persisted).await? {
                    self.discard_queued(key, stored_at).await;
                }
                Ok(())
            }
            Mutation::Delete { at } => self.delete_durable(key, at).await,
        }
    }

    /// Queued writes of `key` up to `at` are older than the write that just
    /// reached the durable tier; replaying them would undo it.
    async fn discard_queued(&self, key: &str, at: u64) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Err(e) = queue.discard_entry_writes(key, at).await {
            warn!(key, error = %e, "Could not discard superseded queued writes");
        }
    }

    /// Whether a valid (fresh or stale) value is cached in memory or the
    /// durable tier. Never consults the origin.
    pub async fn has(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        {
            let mut mem = self.memory.lock();
            if let Some(entry) = mem.entries.get(key) {
                let validation = match self.registry.get(&entry.policy_name) {
                    Some(policy) => self.signals.validate(&policy, entry.stored_at, now),
                    None => Validation::Invalid { refresh: false },
                };
                if !matches!(validation, Validation::Invalid { .. }) {
                    return true;
                }
                mem.remove(key);
            }
        }

        match self.durable.read(key).await {
            Ok(Some(persisted)) => {
                let valid = self.registry.get(&persisted.policy_name).is_some_and(|policy| {
                    !matches!(
                        self.signals.validate(&policy, persisted.stored_at, now),
                        Validation::Invalid { .. }
                    )
                });
                if !valid {
                    self.delete_durable_quietly(key).await;
                }
                valid
            }
            Ok(None) => false,
            Err(e) => {
                debug!(key, error = %e, "Durable tier unreadable during has()");
                false
            }
        }
    }

    /// Evict to the policy budget, then to the global budget.
    fn enforce_budgets(&self, mem: &mut MemoryTier<V>, policy: &CachePolicy) {
        let used = mem.policy_bytes(&policy.name);
        let victims = self
            .evictor
            .select_victims(mem.entries.values(), &policy.name, used, policy.max_bytes);
        let mut evicted = 0usize;
        for victim in victims {
            if mem.remove(&victim.key).is_some() {
                self.metrics.record_eviction(&victim.policy_name);
                evicted += 1;
                debug!(key = %victim.key, policy = %victim.policy_name, "Evicted entry");
            }
        }

        if self.config.max_memory_bytes > 0 && mem.total_bytes > self.config.max_memory_bytes {
            let order = self.registry.names_by_eviction_order();
            let victims = self.evictor.select_global_victims(
                mem.entries.values(),
                &order,
                mem.total_bytes,
                self.config.max_memory_bytes,
            );
            for victim in victims {
                if mem.remove(&victim.key).is_some() {
                    self.metrics.record_eviction(&victim.policy_name);
                    evicted += 1;
                    debug!(key = %victim.key, policy = %victim.policy_name, "Evicted entry under global pressure");
                }
            }
        }

        if evicted > 0 {
            info!(
                evicted,
                policy = %policy.name,
                policy_bytes = mem.policy_bytes(&policy.name),
                total_bytes = mem.total_bytes,
                "Eviction round complete"
            );
        }
        self.metrics.memory_bytes.set(mem.total_bytes as i64);
    }

    /// Write through to the durable tier, queueing on failure. Returns
    /// whether the durable tier took the write directly.
    async fn persist(&self, key: &str, persisted: PersistedEntry) -> Result<bool, StoreError> {
        match self.durable.write(key, &persisted).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(key, error = %e, "Durable write failed, queueing");
                self.metrics.durable_errors_total.inc();
                self.enqueue(
                    key,
                    WriteOp::PutEntry {
                        key: key.to_string(),
                        entry: persisted,
                    },
                )
                .await
                .map(|()| false)
            }
        }
    }

    async fn enqueue(&self, key: &str, op: WriteOp) -> Result<(), StoreError> {
        let Some(queue) = &self.queue else {
            warn!(key, "No write queue configured; write kept in memory only");
            return Ok(());
        };
        match queue.enqueue(op).await {
            Ok(id) => {
                debug!(key, %id, "Queued durable write");
                Ok(())
            }
            Err(QueueError::Full { .. }) => Err(StoreError::QueueFull {
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::Unpersisted {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn delete_durable_quietly(&self, key: &str) {
        if let Err(e) = self.durable.delete(key).await {
            debug!(key, error = %e, "Could not delete invalid durable entry");
        }
    }

    /// Drop memory-tier entries that no longer validate. Returns how many
    /// were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut mem = self.memory.lock();
        let expired: Vec<String> = mem
            .entries
            .values()
            .filter(|entry| match self.registry.get(&entry.policy_name) {
                Some(policy) => matches!(
                    self.signals.validate(&policy, entry.stored_at, now),
                    Validation::Invalid { .. }
                ),
                None => true,
            })
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired {
            mem.remove(key);
        }
        self.metrics.memory_bytes.set(mem.total_bytes as i64);
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept invalid memory entries");
        }
        expired.len()
    }

    /// Empty the memory tier.
    pub fn clear_memory(&self) {
        let mut mem = self.memory.lock();
        mem.clear();
        self.metrics.memory_bytes.set(0);
        info!("Memory tier cleared");
    }

    /// Drop every memory entry tagged with `policy_name`.
    pub fn clear_policy(&self, policy_name: &str) -> usize {
        let mut mem = self.memory.lock();
        let keys: Vec<String> = mem
            .entries
            .values()
            .filter(|e| e.policy_name == policy_name)
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            mem.remove(key);
        }
        self.metrics.memory_bytes.set(mem.total_bytes as i64);
        info!(policy = policy_name, removed = keys.len(), "Cleared policy from memory tier");
        keys.len()
    }

    pub fn stats(&self) -> StoreStats {
        let mem = self.memory.lock();
        StoreStats {
            entries: mem.entries.len(),
            total_bytes: mem.total_bytes,
            policy_bytes: mem.policy_bytes.clone(),
        }
    }

    pub fn policy_bytes(&self, policy_name: &str) -> usize {
        self.memory.lock().policy_bytes(policy_name)
    }

    /// Whether the memory tier currently holds `key` (valid or not).
    pub fn in_memory(&self, key: &str) -> bool {
        self.memory.lock().entries.contains_key(key)
    }

    /// Read access count of a memory entry.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.memory.lock().entries.get(key).map(|e| e.access_count)
    }
}
