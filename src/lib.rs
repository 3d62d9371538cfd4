//! companion-cache: multi-tier cache and consistency layer.
//!
//! Reads go through a memory tier, a local durable tier and finally an
//! origin provider, with policy-scoped eviction, single-flight fetches,
//! access-pattern prefetching, a durable offline write queue and
//! lock-protected item moves between containers.

pub mod cache;
pub mod config;
pub mod runtime;
pub mod storage;
pub mod sync;

pub use cache::store::{Lookup, StoreError};
pub use runtime::CacheRuntime;
