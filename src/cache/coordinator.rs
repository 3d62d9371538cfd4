//! Request coordination: at most one tier walk per key at a time.
//!
//! The first caller for a key spawns the fetch on the runtime and parks a
//! shared handle to it in the in-flight map; later callers attach to that
//! handle. The fetch task removes its own entry before resolving, so a
//! caller arriving after completion starts a fresh fetch. Dropping any
//! caller (even the first) never cancels the fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::predictor::PredictionEngine;
use crate::cache::store::{Lookup, StoreError, TieredStore};
use crate::cache::CacheValue;

type FetchResult<V> = Result<Option<Lookup<V>>, StoreError>;
type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

struct InFlight<V> {
    id: u64,
    fetch: SharedFetch<V>,
}

type InFlightMap<V> = Arc<Mutex<HashMap<String, InFlight<V>>>>;

pub struct RequestCoordinator<V> {
    store: Arc<TieredStore<V>>,
    in_flight: InFlightMap<V>,
    next_id: AtomicU64,
    predictor: Option<Arc<PredictionEngine>>,
}

impl<V: CacheValue> RequestCoordinator<V> {
    pub fn new(store: Arc<TieredStore<V>>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            predictor: None,
        }
    }

    /// Record accesses into `predictor` on successful reads and writes.
    pub fn with_predictor(mut self, predictor: Arc<PredictionEngine>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn store(&self) -> &Arc<TieredStore<V>> {
        &self.store
    }

    /// Keys with a fetch currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub async fn get(&self, key: &str) -> FetchResult<V> {
        let policy = self.store.default_policy().to_string();
        self.get_with_policy(key, &policy).await
    }

    pub async fn get_with_policy(&self, key: &str, policy_name: &str) -> FetchResult<V> {
        let result = self.fetch(key, policy_name).await;
        if let (Ok(Some(lookup)), Some(predictor)) = (&result, &self.predictor) {
            predictor.record_access(key, &lookup.policy_name);
        }
        result
    }

    /// Speculative read: same path as `get`, but not recorded as an access.
    /// Returns whether a value was found.
    pub async fn prefetch(&self, key: &str, policy_name: &str) -> Result<bool, StoreError> {
        self.store.metrics().prefetches_total.inc();
        Ok(self.fetch(key, policy_name).await?.is_some())
    }

    pub async fn set(&self, key: &str, value: V, policy_name: &str) -> Result<(), StoreError> {
        let result = self.store.set(key, value, policy_name).await;
        self.detach(key);
        if result.is_ok() {
            if let Some(predictor) = &self.predictor {
                predictor.record_access(key, policy_name);
            }
        }
        result
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = self.store.delete(key).await;
        self.detach(key);
        result
    }

    pub async fn has(&self, key: &str) -> bool {
        self.store.has(key).await
    }

    /// Stop handing out an in-flight fetch that may predate a write.
    fn detach(&self, key: &str) {
        if self.in_flight.lock().remove(key).is_some() {
            debug!(key, "Detached in-flight fetch after write");
        }
    }

    fn fetch(&self, key: &str, policy_name: &str) -> SharedFetch<V> {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(key) {
            self.store.metrics().coalesced_total.inc();
            debug!(key, "Joined in-flight fetch");
            return existing.fetch.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let map = self.in_flight.clone();
        let task_key = key.to_string();
        let task_policy = policy_name.to_string();

        // Spawned under the map lock, so the task cannot clear its entry
        // before it has been inserted.
        let handle = tokio::spawn(async move {
            let result = store.get_with_policy(&task_key, &task_policy).await;
            release(&map, &task_key, id);
            result
        });

        let map = self.in_flight.clone();
        let waiter_key = key.to_string();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    release(&map, &waiter_key, id);
                    Err(StoreError::Internal {
                        key: waiter_key,
                        reason: e.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }
}

fn release<V>(map: &Mutex<HashMap<String, InFlight<V>>>, key: &str, id: u64) {
    let mut map = map.lock();
    if map.get(key).is_some_and(|f| f.id == id) {
        map.remove(key);
    }
}
