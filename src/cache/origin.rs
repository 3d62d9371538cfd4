//! The origin provider: the slow, expensive source of truth behind the cache.

use async_trait::async_trait;
use thiserror::Error;

/// An origin failure. Cloneable so one failure can be handed to every
/// caller attached to the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct OriginError(pub String);

impl OriginError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[async_trait]
pub trait OriginProvider<V>: Send + Sync {
    /// Fetch `key`. `Ok(None)` means the origin has nothing for it.
    async fn fetch(&self, key: &str) -> Result<Option<V>, OriginError>;
}

/// An origin that never has anything; for deployments that only serve
/// what was explicitly `set`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOrigin;

#[async_trait]
impl<V: Send + 'static> OriginProvider<V> for NoOrigin {
    async fn fetch(&self, _key: &str) -> Result<Option<V>, OriginError> {
        Ok(None)
    }
}
