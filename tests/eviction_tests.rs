//! Integration tests for policy-scoped eviction.

mod common;

use common::fixtures::{harness, harness_with, ScriptedOrigin};
use companion_cache::cache::entry::CacheEntry;
use companion_cache::cache::evictor::Evictor;
use companion_cache::cache::policy::{CachePolicy, PolicyRegistry};
use companion_cache::config::StoreConfig;

fn entry(key: &str, policy: &str, stored_at: u64, size: usize) -> CacheEntry<()> {
    CacheEntry::new(key.to_string(), (), policy.to_string(), stored_at, size)
}

#[test]
fn test_victims_are_oldest_first() {
    let evictor = Evictor::new();
    let entries = vec![
        entry("newest", "p", 300, 10),
        entry("oldest", "p", 100, 10),
        entry("middle", "p", 200, 10),
        entry("other-policy", "q", 1, 10),
    ];

    let victims = evictor.select_victims(entries.iter(), "p", 30, 15);
    let keys: Vec<&str> = victims.iter().map(|v| v.key.as_str()).collect();
    assert_eq!(keys, vec!["oldest", "middle"]);
}

#[test]
fn test_no_victims_within_budget() {
    let evictor = Evictor::new();
    let entries = vec![entry("a", "p", 1, 10)];
    assert!(evictor.select_victims(entries.iter(), "p", 10, 10).is_empty());
}

#[tokio::test]
async fn test_policy_bytes_never_exceed_budget() {
    let h = harness(ScriptedOrigin::new());

    // "small" allows 100 bytes; each value encodes to 11 bytes.
    for i in 0..50 {
        h.store
            .set(&format!("key-{i:03}"), format!("value-{i:03}"), "small")
            .await
            .unwrap();
        h.clock.advance(1);
        assert!(h.store.policy_bytes("small") <= 100);
    }

    // The newest entries survive.
    assert!(h.store.in_memory("key-049"));
    assert!(!h.store.in_memory("key-000"));
    assert!(h.store.metrics().evictions_total.with_label_values(&["small"]).get() > 0);
}

#[tokio::test]
async fn test_eviction_is_memory_only() {
    let h = harness(ScriptedOrigin::new());
    for i in 0..20 {
        h.store
            .set(&format!("key-{i:03}"), format!("value-{i:03}"), "small")
            .await
            .unwrap();
        h.clock.advance(1);
    }

    assert!(!h.store.in_memory("key-000"));
    assert!(h.durable.inner.contains_entry("key-000"));

    // An evicted entry is still served from the durable tier.
    let hit = h.store.get("key-000").await.unwrap().unwrap();
    assert_eq!(hit.value, "value-000");
}

#[tokio::test]
async fn test_other_policies_untouched_by_policy_eviction() {
    let h = harness(ScriptedOrigin::new());
    h.store.set("keep", "x".into(), "default").await.unwrap();
    for i in 0..20 {
        h.store
            .set(&format!("key-{i:03}"), format!("value-{i:03}"), "small")
            .await
            .unwrap();
    }
    assert!(h.store.in_memory("keep"));
}

#[tokio::test]
async fn test_global_budget_evicts_least_important_policy_first() {
    let registry = PolicyRegistry::new();
    registry.register(CachePolicy::new("default", 5, 60_000, 1024));
    registry.register(CachePolicy::new("important", 1, 60_000, 1024));
    registry.register(CachePolicy::new("disposable", 9, 60_000, 1024));

    let config = StoreConfig {
        max_memory_bytes: 60,
        ..StoreConfig::default()
    };
    let h = harness_with(ScriptedOrigin::new(), config, registry.into());

    // Each value encodes to 14 bytes.
    h.store.set("imp-1", "value-imp-01".into(), "important").await.unwrap();
    h.store.set("imp-2", "value-imp-02".into(), "important").await.unwrap();
    h.store.set("dis-1", "value-dis-01".into(), "disposable").await.unwrap();
    h.store.set("dis-2", "value-dis-02".into(), "disposable").await.unwrap();
    h.store.set("imp-3", "value-imp-03".into(), "important").await.unwrap();
    h.store.set("imp-4", "value-imp-04".into(), "important").await.unwrap();

    let stats = h.store.stats();
    assert!(stats.total_bytes <= 60);
    assert!(!h.store.in_memory("dis-1"));
    assert!(h.store.in_memory("imp-1"));
    assert!(h.store.in_memory("imp-4"));
}
