//! Cache entry types, tier definitions and the clock used for expiry.
//!
//! An entry is the unit that moves between tiers: the memory tier holds the
//! native value, the durable tier holds a [`PersistedEntry`] produced by the
//! codec.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifies which tier served (or holds) a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 0: in-process memory (hot).
    Memory,
    /// Tier 1: local durable store (warm).
    Durable,
    /// Tier 2: origin provider (cold, expensive).
    Origin,
}

impl Tier {
    /// Stable label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Durable => "durable",
            Tier::Origin => "origin",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of wall-clock milliseconds for `stored_at` / expiry decisions.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic expiry tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A single memory-tier entry.
///
/// The TTL is never copied in: expiry is judged against the policy as it
/// is registered at read time.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,

    /// Wall-clock milliseconds when the value was stored.
    pub stored_at: u64,

    pub policy_name: String,

    /// Number of reads served from this entry.
    pub access_count: u64,

    /// Size of the encoded value (uncompressed).
    pub size_bytes: usize,

    /// Insertion sequence number; breaks `stored_at` ties for eviction and
    /// orders sets against in-flight origin fetches.
    pub seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(key: String, value: V, policy_name: String, stored_at: u64, size_bytes: usize) -> Self {
        Self {
            key,
            value,
            stored_at,
            policy_name,
            access_count: 0,
            size_bytes,
            seq: 0,
        }
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.access_count += 1;
    }
}

/// Durable-tier representation of an entry: the value crosses the tier
/// boundary as encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: String,
    pub policy_name: String,
    pub stored_at: u64,
    pub access_count: u64,

    /// Size of the uncompressed encoding.
    pub size_bytes: usize,

    /// Whether `payload` is zstd-compressed.
    pub compressed: bool,

    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_labels() {
        assert_eq!(Tier::Memory.to_string(), "memory");
        assert_eq!(Tier::Origin.as_str(), "origin");
    }

    #[test]
    fn test_touch_counts_reads() {
        let mut entry = CacheEntry::new("k".into(), 1u32, "p".into(), 5_000, 4);
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 15);
        clock.set(3);
        assert_eq!(clock.now_ms(), 3);
    }
}
