//! Wiring and lifecycle.
//!
//! [`CacheRuntime`] constructs every component from a [`Config`], shares
//! them where they meet (store, coordinator, predictor, queue, migration
//! coordinator) and owns the background loops: prefetch, queue flush and
//! the expiry sweep. Dropping the runtime without calling
//! [`CacheRuntime::shutdown`] leaves the loops running until the tokio
//! runtime itself stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::coordinator::RequestCoordinator;
use crate::cache::entry::{Clock, SystemClock};
use crate::cache::metrics::CacheMetrics;
use crate::cache::origin::OriginProvider;
use crate::cache::policy::InvalidationSignals;
use crate::cache::predictor::PredictionEngine;
use crate::cache::prefetcher::Prefetcher;
use crate::cache::store::{Lookup, StoreError, StoreParts, StoreStats, TieredStore};
use crate::cache::CacheValue;
use crate::config::Config;
use crate::storage::{ItemId, PersistentTier};
use crate::sync::flusher::{FlushReport, Flusher};
use crate::sync::migration::{ConsistencyCoordinator, MigrationError, MigrationReport};
use crate::sync::write_queue::{DurableWriteQueue, QueueError, SyncStatus, WriteOp};

pub struct CacheRuntime<V> {
    config: Config,
    durable: Arc<dyn PersistentTier>,
    store: Arc<TieredStore<V>>,
    coordinator: Arc<RequestCoordinator<V>>,
    predictor: Arc<PredictionEngine>,
    migrations: Arc<ConsistencyCoordinator>,
    queue: Arc<DurableWriteQueue>,
    metrics: Arc<CacheMetrics>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<V: CacheValue> CacheRuntime<V> {
    /// Build every component and start the background loops.
    pub async fn start(
        config: Config,
        durable: Arc<dyn PersistentTier>,
        origin: Arc<dyn OriginProvider<V>>,
    ) -> anyhow::Result<Self> {
        let mut runtime = Self::build(config, durable, origin, Arc::new(SystemClock)).await?;
        runtime.spawn_background();
        Ok(runtime)
    }

    /// Build every component without starting any loop.
    pub async fn build(
        config: Config,
        durable: Arc<dyn PersistentTier>,
        origin: Arc<dyn OriginProvider<V>>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let metrics = Arc::new(CacheMetrics::new()?);
        let registry = Arc::new(config.registry());
        let signals = Arc::new(InvalidationSignals::new(clock.clone()));

        let queue = Arc::new(
            DurableWriteQueue::open(config.queue.clone(), &config.store.data_dir)
                .await
                .with_clock(clock.clone())
                .with_metrics(metrics.clone()),
        );

        let parts = StoreParts::new(durable.clone(), origin, metrics.clone())
            .with_registry(registry)
            .with_clock(clock.clone())
            .with_signals(signals)
            .with_queue(queue.clone())
            .with_compression(config.compression.clone());
        let store = Arc::new(TieredStore::new(config.store.clone(), parts));

        let predictor = Arc::new(PredictionEngine::new(config.prediction.clone(), clock.clone()));
        let coordinator = Arc::new(RequestCoordinator::new(store.clone()).with_predictor(predictor.clone()));

        let migrations = Arc::new(
            ConsistencyCoordinator::new(durable.clone(), config.migration.clone())
                .with_clock(clock)
                .with_metrics(metrics.clone())
                .with_queue(queue.clone()),
        );

        let (shutdown, _) = watch::channel(false);
        info!(
            data_dir = %config.store.data_dir.display(),
            policies = store.registry().len(),
            queue_engine = %queue.engine_kind().await,
            "Cache runtime ready"
        );

        Ok(Self {
            config,
            durable,
            store,
            coordinator,
            predictor,
            migrations,
            queue,
            metrics,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Spawn the prefetch, flush and sweep loops.
    pub fn spawn_background(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }

        if self.config.prediction.enabled {
            let prefetcher = Prefetcher::new(self.coordinator.clone(), self.predictor.clone());
            let interval = Duration::from_millis(self.config.prediction.interval_ms);
            self.tasks
                .push(tokio::spawn(prefetcher.run(interval, self.shutdown.subscribe())));
        }

        let flusher = Flusher::new(self.queue.clone(), self.durable.clone())
            .with_migrations(self.migrations.clone());
        let interval = Duration::from_millis(self.config.queue.flush_interval_ms);
        self.tasks
            .push(tokio::spawn(flusher.run(interval, self.shutdown.subscribe())));

        let interval = Duration::from_millis(self.config.maintenance.sweep_interval_ms);
        self.tasks.push(tokio::spawn(sweep_loop(
            self.store.clone(),
            interval,
            self.shutdown.subscribe(),
        )));

        info!(loops = self.tasks.len(), "Background loops started");
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!("Cache runtime stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredStore<V>> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator<V>> {
        &self.coordinator
    }

    pub fn predictor(&self) -> &Arc<PredictionEngine> {
        &self.predictor
    }

    pub fn migrations(&self) -> &Arc<ConsistencyCoordinator> {
        &self.migrations
    }

    pub fn queue(&self) -> &Arc<DurableWriteQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn signals(&self) -> &Arc<InvalidationSignals> {
        self.store.signals()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Lookup<V>>, StoreError> {
        self.coordinator.get(key).await
    }

    pub async fn get_with_policy(&self, key: &str, policy_name: &str) -> Result<Option<Lookup<V>>, StoreError> {
        self.coordinator.get_with_policy(key, policy_name).await
    }

    pub async fn set(&self, key: &str, value: V, policy_name: &str) -> Result<(), StoreError> {
        self.coordinator.set(key, value, policy_name).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.coordinator.delete(key).await
    }

    pub async fn has(&self, key: &str) -> bool {
        self.coordinator.has(key).await
    }

    pub async fn migrate(&self, items: &[ItemId], from: &str, to: &str) -> Result<MigrationReport, MigrationError> {
        self.migrations.migrate(items, from, to).await
    }

    pub async fn enqueue(&self, op: WriteOp) -> Result<Uuid, QueueError> {
        self.queue.enqueue(op).await
    }

    /// Replay the write queue now instead of waiting for the next tick.
    pub async fn flush_now(&self) -> Result<FlushReport, QueueError> {
        Flusher::new(self.queue.clone(), self.durable.clone())
            .with_migrations(self.migrations.clone())
            .flush_once()
            .await
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.queue.sync_status()
    }
}

async fn sweep_loop<V: CacheValue>(
    store: Arc<TieredStore<V>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.sweep_expired();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Sweeper stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::ManualClock;
    use crate::cache::origin::NoOrigin;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::Container;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.store.data_dir = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let runtime: CacheRuntime<String> =
            CacheRuntime::start(config(&dir), Arc::new(InMemoryStore::new()), Arc::new(NoOrigin))
                .await
                .unwrap();

        runtime.set("k", "v".into(), "default").await.unwrap();
        assert_eq!(runtime.get("k").await.unwrap().unwrap().value, "v");
        assert!(runtime.has("k").await);
        assert_eq!(runtime.stats().entries, 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.store.default_policy = "nope".into();
        let result: anyhow::Result<CacheRuntime<String>> =
            CacheRuntime::start(config, Arc::new(InMemoryStore::new()), Arc::new(NoOrigin)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_signals_reach_the_store() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let runtime: CacheRuntime<String> = CacheRuntime::build(
            config(&dir),
            Arc::new(InMemoryStore::new()),
            Arc::new(NoOrigin),
            clock.clone(),
        )
        .await
        .unwrap();

        runtime.set("theme", "dark".into(), "user_preferences").await.unwrap();
        clock.advance(10);
        runtime.signals().record_user_action("preference_change");
        assert!(runtime.get("theme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migrate_through_runtime() {
        let dir = TempDir::new().unwrap();
        let durable = Arc::new(InMemoryStore::new());
        durable.insert_container(Container::new("a", vec!["m1".into()]));
        durable.insert_container(Container::new("b", vec![]));
        let runtime: CacheRuntime<String> =
            CacheRuntime::build(config(&dir), durable.clone(), Arc::new(NoOrigin), Arc::new(SystemClock))
                .await
                .unwrap();

        runtime.migrate(&["m1".to_string()], "a", "b").await.unwrap();
        assert_eq!(durable.container_items("b").unwrap(), vec!["m1".to_string()]);
        assert_eq!(runtime.metrics().migrations_total.with_label_values(&["moved"]).get(), 1);
    }
}
