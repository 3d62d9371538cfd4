//! Serialization boundary between the memory tier and the durable tier.
//!
//! Values are encoded as JSON; encodings at or above the configured
//! threshold are zstd-compressed before they are persisted. Decoding
//! reverses the pipeline.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::cache::entry::{CacheEntry, PersistedEntry};
use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Zstd failed: {0}")]
    Zstd(#[from] std::io::Error),
}

/// Encodes values for the durable tier and decodes them back.
#[derive(Debug, Clone)]
pub struct Codec {
    config: CompressionConfig,
}

impl Codec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Encode a memory-tier entry for the durable tier.
    pub fn encode<V: Serialize>(&self, entry: &CacheEntry<V>) -> Result<PersistedEntry, CodecError> {
        let raw = serde_json::to_vec(&entry.value)?;
        let size_bytes = raw.len();

        let (payload, compressed) = if self.config.enabled && size_bytes >= self.config.threshold_bytes {
            (self.zstd_compress(&raw)?, true)
        } else {
            (raw, false)
        };

        Ok(PersistedEntry {
            key: entry.key.clone(),
            policy_name: entry.policy_name.clone(),
            stored_at: entry.stored_at,
            access_count: entry.access_count,
            size_bytes,
            compressed,
            payload,
        })
    }

    /// Decode a durable-tier entry back into a memory-tier entry.
    pub fn decode<V: DeserializeOwned>(&self, persisted: &PersistedEntry) -> Result<CacheEntry<V>, CodecError> {
        let value: V = if persisted.compressed {
            let raw = self.zstd_decompress(&persisted.payload)?;
            serde_json::from_slice(&raw)?
        } else {
            serde_json::from_slice(&persisted.payload)?
        };

        let mut entry = CacheEntry::new(
            persisted.key.clone(),
            value,
            persisted.policy_name.clone(),
            persisted.stored_at,
            persisted.size_bytes,
        );
        entry.access_count = persisted.access_count;
        Ok(entry)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(zstd::encode_all(data, self.config.zstd_level)?)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(zstd::decode_all(data)?)
    }
}
