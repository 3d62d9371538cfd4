//! Eviction policy: decides which memory-tier entries to drop.
//!
//! Two budgets are enforced:
//! - per policy: oldest entries of that policy go first until the policy is
//!   back at or below its `max_bytes`
//! - global (optional): least important policies go first, oldest first
//!   within a policy, until the whole tier fits
//!
//! Age is `stored_at` (a recency proxy, not full LRU); the insertion
//! sequence breaks ties.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use crate::cache::entry::CacheEntry;

/// An eviction candidate. Smaller `(rank, stored_at, seq)` is evicted first.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub policy_name: String,
    pub rank: usize,
    pub stored_at: u64,
    pub seq: u64,
    pub size_bytes: usize,
}

impl EvictionCandidate {
    fn sort_key(&self) -> (usize, u64, u64) {
        (self.rank, self.stored_at, self.seq)
    }
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// The eviction engine. Stateless; the store owns the entries and the byte
/// accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select entries of `policy_name` to drop so that `current_bytes` falls
    /// to at most `budget`. Returned oldest first.
    pub fn select_victims<'a, V: 'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry<V>>,
        policy_name: &str,
        current_bytes: usize,
        budget: usize,
    ) -> Vec<EvictionCandidate> {
        if current_bytes <= budget {
            return Vec::new();
        }

        let heap: BinaryHeap<Reverse<EvictionCandidate>> = entries
            .filter(|e| e.policy_name == policy_name)
            .map(|e| Reverse(candidate(e, 0)))
            .collect();

        drain_until(heap, current_bytes, budget)
    }

    /// Select entries across all policies so the tier total falls to at most
    /// `budget`. `eviction_order` lists policy names least important first;
    /// entries of unlisted policies are ranked after every listed one.
    pub fn select_global_victims<'a, V: 'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry<V>>,
        eviction_order: &[String],
        current_bytes: usize,
        budget: usize,
    ) -> Vec<EvictionCandidate> {
        if current_bytes <= budget {
            return Vec::new();
        }

        let ranks: HashMap<&str, usize> = eviction_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let unlisted = eviction_order.len();

        let heap: BinaryHeap<Reverse<EvictionCandidate>> = entries
            .map(|e| {
                let rank = ranks.get(e.policy_name.as_str()).copied().unwrap_or(unlisted);
                Reverse(candidate(e, rank))
            })
            .collect();

        drain_until(heap, current_bytes, budget)
    }
}

fn candidate<V>(entry: &CacheEntry<V>, rank: usize) -> EvictionCandidate {
    EvictionCandidate {
        key: entry.key.clone(),
        policy_name: entry.policy_name.clone(),
        rank,
        stored_at: entry.stored_at,
        seq: entry.seq,
        size_bytes: entry.size_bytes,
    }
}

fn drain_until(
    mut heap: BinaryHeap<Reverse<EvictionCandidate>>,
    current_bytes: usize,
    budget: usize,
) -> Vec<EvictionCandidate> {
    let mut remaining = current_bytes;
    let mut victims = Vec::new();
    while remaining > budget {
        match heap.pop() {
            Some(Reverse(victim)) => {
                remaining = remaining.saturating_sub(victim.size_bytes);
                victims.push(victim);
            }
            None => break,
        }
    }
    victims
}
