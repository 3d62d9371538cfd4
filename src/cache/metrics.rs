//! Prometheus metrics for the cache and consistency layer.
//!
//! Each [`CacheMetrics`] owns its own [`Registry`], so independently
//! constructed runtimes (and tests) never share counters.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::cache::entry::Tier;

/// `get` latency buckets (seconds): 100µs .. 5s.
const GET_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0,
];

pub struct CacheMetrics {
    registry: Registry,

    /// Hits, labelled by tier.
    pub hits_total: IntCounterVec,
    pub misses_total: IntCounter,
    pub origin_fetches_total: IntCounter,
    pub origin_errors_total: IntCounter,
    /// Callers that attached to an already in-flight fetch.
    pub coalesced_total: IntCounter,
    /// Evicted entries, labelled by policy.
    pub evictions_total: IntCounterVec,
    pub stale_served_total: IntCounter,
    /// Durable-tier operations that failed and were degraded around.
    pub durable_errors_total: IntCounter,
    pub prefetches_total: IntCounter,
    /// Migrations, labelled by outcome.
    pub migrations_total: IntCounterVec,
    pub queue_depth: IntGauge,
    pub memory_bytes: IntGauge,
    pub get_duration_seconds: Histogram,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("companion_cache".into()), None)?;

        let hits_total = IntCounterVec::new(Opts::new("hits_total", "Cache hits by tier"), &["tier"])?;
        let misses_total = IntCounter::new("misses_total", "Reads that found nothing in any tier")?;
        let origin_fetches_total = IntCounter::new("origin_fetches_total", "Origin provider invocations")?;
        let origin_errors_total = IntCounter::new("origin_errors_total", "Failed origin fetches")?;
        let coalesced_total = IntCounter::new(
            "coalesced_total",
            "Reads that joined an already in-flight fetch",
        )?;
        let evictions_total = IntCounterVec::new(
            Opts::new("evictions_total", "Memory-tier evictions by policy"),
            &["policy"],
        )?;
        let stale_served_total = IntCounter::new("stale_served_total", "Values served marked stale")?;
        let durable_errors_total = IntCounter::new(
            "durable_errors_total",
            "Durable-tier operations that failed and were degraded",
        )?;
        let prefetches_total = IntCounter::new("prefetches_total", "Speculative fetches issued")?;
        let migrations_total = IntCounterVec::new(
            Opts::new("migrations_total", "Container migrations by outcome"),
            &["outcome"],
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Pending writes in the durable queue")?;
        let memory_bytes = IntGauge::new("memory_bytes", "Bytes held by the memory tier")?;
        let get_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("get_duration_seconds", "Latency of cache reads")
                .buckets(GET_LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(hits_total.clone()))?;
        registry.register(Box::new(misses_total.clone()))?;
        registry.register(Box::new(origin_fetches_total.clone()))?;
        registry.register(Box::new(origin_errors_total.clone()))?;
        registry.register(Box::new(coalesced_total.clone()))?;
        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(stale_served_total.clone()))?;
        registry.register(Box::new(durable_errors_total.clone()))?;
        registry.register(Box::new(prefetches_total.clone()))?;
        registry.register(Box::new(migrations_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;
        registry.register(Box::new(get_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            hits_total,
            misses_total,
            origin_fetches_total,
            origin_errors_total,
            coalesced_total,
            evictions_total,
            stale_served_total,
            durable_errors_total,
            prefetches_total,
            migrations_total,
            queue_depth,
            memory_bytes,
            get_duration_seconds,
        })
    }

    pub fn record_hit(&self, tier: Tier) {
        self.hits_total.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_eviction(&self, policy: &str) {
        self.evictions_total.with_label_values(&[policy]).inc();
    }

    pub fn record_migration(&self, outcome: &str) {
        self.migrations_total.with_label_values(&[outcome]).inc();
    }

    pub fn hits(&self, tier: Tier) -> u64 {
        self.hits_total.with_label_values(&[tier.as_str()]).get()
    }

    fn total_hits(&self) -> u64 {
        [Tier::Memory, Tier::Durable, Tier::Origin]
            .iter()
            .map(|t| self.hits(*t))
            .sum()
    }

    /// Fraction of reads answered by any tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.misses_total.get();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn miss_rate(&self) -> f64 {
        let misses = self.misses_total.get();
        let total = self.total_hits() + misses;
        if total == 0 {
            return 0.0;
        }
        misses as f64 / total as f64
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let metrics = CacheMetrics::new().unwrap();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.record_hit(Tier::Memory);
        metrics.record_hit(Tier::Durable);
        metrics.record_hit(Tier::Origin);
        metrics.misses_total.inc();

        assert!((metrics.hit_rate() - 0.75).abs() < 1e-9);
        assert!((metrics.miss_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();
        a.record_hit(Tier::Memory);
        assert_eq!(a.hits(Tier::Memory), 1);
        assert_eq!(b.hits(Tier::Memory), 0);
    }

    #[test]
    fn test_render_contains_prefix() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.record_eviction("default");
        let text = metrics.render();
        assert!(text.contains("companion_cache_evictions_total"));
    }
}
