//! Test fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use companion_cache::cache::entry::{Clock, ManualClock, PersistedEntry};
use companion_cache::cache::metrics::CacheMetrics;
use companion_cache::cache::origin::{OriginError, OriginProvider};
use companion_cache::cache::policy::{CachePolicy, PolicyRegistry};
use companion_cache::cache::store::{StoreParts, TieredStore};
use companion_cache::config::StoreConfig;
use companion_cache::storage::memory::InMemoryStore;
use companion_cache::storage::{Container, PersistentTier, StorageError};

pub const START_MS: u64 = 1_702_512_000_000;

/// Persistent tier wrapper with switchable failures and latency.
#[derive(Default)]
pub struct FlakyTier {
    pub inner: InMemoryStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Container ids whose writes fail, with the writes still allowed first.
    pub fail_container_writes: Mutex<HashMap<String, usize>>,
    /// Latency added to container reads and writes, in ms.
    pub container_delay_ms: AtomicU64,
    pub writes: AtomicUsize,
    pub writes_held: AtomicBool,
    pub write_gate: Notify,
}

impl FlakyTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_container(&self, id: &str) {
        self.fail_container_after(id, 0);
    }

    /// Let `allowed` more writes to container `id` through, then fail.
    pub fn fail_container_after(&self, id: &str, allowed: usize) {
        self.fail_container_writes.lock().insert(id.to_string(), allowed);
    }

    pub fn heal_container(&self, id: &str) {
        self.fail_container_writes.lock().remove(id);
    }

    pub fn set_container_delay(&self, delay: Duration) {
        self.container_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every entry write until `release_writes` is called.
    pub fn hold_writes(&self) {
        self.writes_held.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.writes_held.store(false, Ordering::SeqCst);
        self.write_gate.notify_waiters();
    }

    pub async fn wait_for_writes(&self, n: usize) {
        while self.writes.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn container_latency(&self) {
        let ms = self.container_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn unavailable(what: &str) -> StorageError {
    StorageError::Unavailable(format!("{what} disabled by test"))
}

#[async_trait]
impl PersistentTier for FlakyTier {
    async fn read(&self, key: &str) -> Result<Option<PersistedEntry>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unavailable("read"));
        }
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, entry: &PersistedEntry) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable("write"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        while self.writes_held.load(Ordering::SeqCst) {
            let notified = self.write_gate.notified();
            if !self.writes_held.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.inner.write(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(unavailable("delete"));
        }
        self.inner.delete(key).await
    }

    async fn read_container(&self, id: &str) -> Result<Option<Container>, StorageError> {
        self.container_latency().await;
        self.inner.read_container(id).await
    }

    async fn write_container(&self, container: &Container) -> Result<(), StorageError> {
        self.container_latency().await;
        if let Some(allowed) = self.fail_container_writes.lock().get_mut(&container.id) {
            if *allowed == 0 {
                return Err(unavailable("container write"));
            }
            *allowed -= 1;
        }
        self.inner.write_container(container).await
    }
}

/// Origin backed by a map, counting calls, optionally held until released.
#[derive(Default)]
pub struct ScriptedOrigin {
    pub values: Mutex<HashMap<String, String>>,
    pub failing: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
    pub gated: AtomicBool,
    pub gate: Notify,
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.values.lock().insert(key.to_string(), value.to_string());
        self
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub fn fail_key(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    /// Hold every fetch until `release` is called.
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl OriginProvider<String> for ScriptedOrigin {
    async fn fetch(&self, key: &str) -> Result<Option<String>, OriginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while self.gated.load(Ordering::SeqCst) {
            let notified = self.gate.notified();
            if !self.gated.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        if self.failing.lock().contains(key) {
            return Err(OriginError::new(format!("origin refused {key}")));
        }
        Ok(self.values.lock().get(key).cloned())
    }
}

/// Registry with one small, short-lived policy per test concern.
pub fn test_registry() -> Arc<PolicyRegistry> {
    let registry = PolicyRegistry::new();
    registry.register(CachePolicy::new("default", 5, 60_000, 1024 * 1024));
    registry.register(CachePolicy::new("short", 3, 1_000, 1024 * 1024));
    registry.register(CachePolicy::new("small", 4, 60_000, 100));
    Arc::new(registry)
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub durable: Arc<FlakyTier>,
    pub origin: Arc<ScriptedOrigin>,
    pub store: Arc<TieredStore<String>>,
}

pub fn harness(origin: ScriptedOrigin) -> Harness {
    harness_with(origin, StoreConfig::default(), test_registry())
}

pub fn harness_with(origin: ScriptedOrigin, config: StoreConfig, registry: Arc<PolicyRegistry>) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let durable = Arc::new(FlakyTier::new());
    let origin = Arc::new(origin);
    let parts = StoreParts::new(
        durable.clone(),
        origin.clone(),
        Arc::new(CacheMetrics::new().unwrap()),
    )
    .with_registry(registry)
    .with_clock(clock.clone() as Arc<dyn Clock>);
    let store = Arc::new(TieredStore::new(config, parts));
    Harness {
        clock,
        durable,
        origin,
        store,
    }
}
