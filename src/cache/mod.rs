//! Multi-tier cache.
//!
//! - [`entry`]: CacheEntry, PersistedEntry, Tier and Clock definitions
//! - [`policy`]: cache policies, invalidation rules and the policy registry
//! - [`store`]: the tiered store (memory → durable → origin)
//! - [`coordinator`]: single-flight request coordination on top of the store
//! - [`evictor`]: per-policy and global budget eviction
//! - [`predictor`]: access-pattern learning and prefetch predictions
//! - [`prefetcher`]: drives predictions into speculative fetches
//! - [`codec`]: JSON + zstd encoding for the durable tier
//! - [`origin`]: the origin provider seam
//! - [`metrics`]: prometheus counters

pub mod codec;
pub mod coordinator;
pub mod entry;
pub mod evictor;
pub mod metrics;
pub mod origin;
pub mod policy;
pub mod predictor;
pub mod prefetcher;
pub mod store;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Values the cache can hold: cloneable, serializable, shareable across tasks.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
