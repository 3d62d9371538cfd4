//! Prefetching: turns surfaced predictions into speculative reads so the
//! value is in a fast tier before the caller asks for it.
//!
//! Each round:
//! 1. Take the predictions above the confidence threshold
//! 2. Skip keys already held by the memory or durable tier
//! 3. Issue the rest concurrently through the request coordinator
//!
//! Failures are logged and swallowed; a prefetch is never load-bearing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::coordinator::RequestCoordinator;
use crate::cache::predictor::PredictionEngine;
use crate::cache::CacheValue;

/// Outcome of one prefetch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub issued: usize,
    pub skipped_cached: usize,
    pub failed: usize,
}

pub struct Prefetcher<V> {
    coordinator: Arc<RequestCoordinator<V>>,
    predictor: Arc<PredictionEngine>,
}

impl<V: CacheValue> Prefetcher<V> {
    pub fn new(coordinator: Arc<RequestCoordinator<V>>, predictor: Arc<PredictionEngine>) -> Self {
        Self { coordinator, predictor }
    }

    pub async fn run_once(&self) -> PrefetchReport {
        let mut report = PrefetchReport::default();
        if !self.predictor.is_enabled() {
            return report;
        }

        let mut tasks = JoinSet::new();
        for prediction in self.predictor.predictions() {
            if self.coordinator.has(&prediction.key).await {
                report.skipped_cached += 1;
                continue;
            }

            debug!(
                key = %prediction.key,
                confidence = prediction.confidence,
                priority = ?prediction.priority,
                "Prefetching predicted key"
            );
            report.issued += 1;
            let coordinator = self.coordinator.clone();
            tasks.spawn(async move {
                let result = coordinator.prefetch(&prediction.key, &prediction.policy_name).await;
                (prediction.key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((key, Err(e))) => {
                    report.failed += 1;
                    warn!(key, error = %e, "Prefetch failed");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Prefetch task panicked");
                }
            }
        }

        if report.issued > 0 {
            info!(
                issued = report.issued,
                skipped = report.skipped_cached,
                failed = report.failed,
                "Prefetch round complete"
            );
        }
        report
    }

    /// Run rounds every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Prefetcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
