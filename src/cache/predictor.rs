//! Access-pattern learning.
//!
//! Every successful read or write records an access. Keys accessed at
//! regular intervals earn high confidence; keys accessed within a short
//! window of each other are remembered as co-access dependencies.
//!
//! Confidence is `max(0, 1 - stddev / mean)` over the inter-access
//! intervals, so a perfectly periodic key scores 1.0 and an erratic one
//! approaches 0. Only predictions above [`CONFIDENCE_THRESHOLD`] are
//! surfaced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::cache::entry::Clock;
use crate::config::PredictionConfig;

/// Predictions at or below this confidence are never surfaced.
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Intervals averaged for the next-access estimate.
const ESTIMATE_WINDOW: usize = 5;

/// Co-access counters kept per key, as a multiple of `max_dependencies`.
const CO_ACCESS_HEADROOM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionPriority {
    Low,
    Medium,
    High,
}

impl PredictionPriority {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.8 {
            PredictionPriority::High
        } else if confidence > 0.6 {
            PredictionPriority::Medium
        } else {
            PredictionPriority::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachePrediction {
    pub key: String,
    pub policy_name: String,
    pub confidence: f64,
    pub priority: PredictionPriority,
    /// Wall-clock ms at which the next access is expected.
    pub estimated_access_at: u64,
    /// Keys usually accessed alongside this one, most frequent first.
    pub dependencies: Vec<String>,
}

#[derive(Debug)]
struct AccessRecord {
    policy_name: String,
    accesses: VecDeque<u64>,
    co_accessed: HashMap<String, u32>,
}

impl AccessRecord {
    fn new(policy_name: &str) -> Self {
        Self {
            policy_name: policy_name.to_string(),
            accesses: VecDeque::new(),
            co_accessed: HashMap::new(),
        }
    }

    fn last_access(&self) -> u64 {
        self.accesses.back().copied().unwrap_or(0)
    }

    /// Keep the `limit` most frequent co-accessed keys.
    fn trim_co_accessed(&mut self, limit: usize) {
        if self.co_accessed.len() <= limit {
            return;
        }
        let mut counts: Vec<(String, u32)> = self.co_accessed.drain().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        self.co_accessed = counts.into_iter().collect();
    }

    fn intervals(&self) -> Vec<f64> {
        self.accesses
            .iter()
            .zip(self.accesses.iter().skip(1))
            .map(|(a, b)| b.saturating_sub(*a) as f64)
            .collect()
    }
}

#[derive(Debug, Default)]
struct PredictorState {
    records: HashMap<String, AccessRecord>,
    /// Recent accesses, oldest first, for co-access detection.
    recent: VecDeque<(String, u64)>,
}

pub struct PredictionEngine {
    config: PredictionConfig,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    state: Mutex<PredictorState>,
}

impl PredictionEngine {
    pub fn new(config: PredictionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            clock,
            state: Mutex::new(PredictorState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Number of keys with a retained access history.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn record_access(&self, key: &str, policy_name: &str) {
        if !self.is_enabled() {
            return;
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let state = &mut *state;

        let window_start = now.saturating_sub(self.config.co_access_window_ms);
        while state.recent.front().is_some_and(|(_, at)| *at < window_start) {
            state.recent.pop_front();
        }

        let neighbours: Vec<String> = state
            .recent
            .iter()
            .filter(|(other, _)| other != key)
            .map(|(other, _)| other.clone())
            .collect();
        let co_access_limit = self.config.max_dependencies.max(1) * CO_ACCESS_HEADROOM;
        for other in &neighbours {
            if let Some(record) = state.records.get_mut(other) {
                *record.co_accessed.entry(key.to_string()).or_default() += 1;
                record.trim_co_accessed(co_access_limit);
            }
        }

        let record = state
            .records
            .entry(key.to_string())
            .or_insert_with(|| AccessRecord::new(policy_name));
        record.policy_name = policy_name.to_string();
        for other in neighbours {
            *record.co_accessed.entry(other).or_default() += 1;
        }
        record.trim_co_accessed(co_access_limit);
        record.accesses.push_back(now);
        while record.accesses.len() > self.config.history_per_key.max(2) {
            record.accesses.pop_front();
        }

        state.recent.push_back((key.to_string(), now));
        while state.recent.len() > self.config.max_tracked_keys.max(1) {
            state.recent.pop_front();
        }

        self.enforce_bounds(state, now);
    }

    fn enforce_bounds(&self, state: &mut PredictorState, now: u64) {
        let horizon = now.saturating_sub(self.config.retention_ms);
        let before = state.records.len();
        state.records.retain(|_, record| {
            while record.accesses.front().is_some_and(|at| *at < horizon) {
                record.accesses.pop_front();
            }
            !record.accesses.is_empty()
        });
        let mut dropped = before - state.records.len();

        let over = state.records.len().saturating_sub(self.config.max_tracked_keys);
        if over > 0 {
            let mut by_age: Vec<(u64, String)> = state
                .records
                .iter()
                .map(|(key, record)| (record.last_access(), key.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(over) {
                state.records.remove(&key);
            }
            dropped += over;
            debug!(dropped = over, "Access history over capacity");
        }

        // Forgotten keys stop counting as anyone's dependency.
        if dropped > 0 {
            let live: HashSet<String> = state.records.keys().cloned().collect();
            for record in state.records.values_mut() {
                record.co_accessed.retain(|other, _| live.contains(other));
            }
        }
    }

    /// Predictions above the confidence threshold, most confident first.
    pub fn predictions(&self) -> Vec<CachePrediction> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        let horizon = now.saturating_sub(self.config.retention_ms);
        let state = self.state.lock();

        let mut predictions: Vec<CachePrediction> = state
            .records
            .iter()
            .filter(|(_, record)| record.last_access() >= horizon)
            .filter_map(|(key, record)| self.score(key, record))
            .filter(|p| p.confidence > CONFIDENCE_THRESHOLD)
            .collect();

        predictions.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.key.cmp(&b.key))
        });
        predictions
    }

    fn score(&self, key: &str, record: &AccessRecord) -> Option<CachePrediction> {
        if record.accesses.len() < self.config.min_accesses.max(2) {
            return None;
        }
        let intervals = record.intervals();
        let confidence = confidence(&intervals);

        let recent = &intervals[intervals.len().saturating_sub(ESTIMATE_WINDOW)..];
        let expected_gap = mean(recent).unwrap_or(0.0).max(0.0).round() as u64;

        let mut dependencies: Vec<(&String, &u32)> = record.co_accessed.iter().collect();
        dependencies.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        Some(CachePrediction {
            key: key.to_string(),
            policy_name: record.policy_name.clone(),
            confidence,
            priority: PredictionPriority::from_confidence(confidence),
            estimated_access_at: record.last_access() + expected_gap,
            dependencies: dependencies
                .into_iter()
                .take(self.config.max_dependencies)
                .map(|(k, _)| k.clone())
                .collect(),
        })
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Regularity of a sequence of intervals in `[0, 1]`.
pub fn confidence(intervals: &[f64]) -> f64 {
    let Some(mean) = mean(intervals) else {
        return 0.0;
    };
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    (1.0 - variance.sqrt() / mean).max(0.0)
}
