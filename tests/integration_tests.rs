//! Integration tests for the wired runtime: coordinator, queue, flusher,
//! prefetcher and the file-backed durable tier together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{harness, FlakyTier, ScriptedOrigin};
use companion_cache::cache::coordinator::RequestCoordinator;
use companion_cache::cache::entry::{Clock, ManualClock, Tier};
use companion_cache::cache::prefetcher::Prefetcher;
use companion_cache::cache::store::StoreError;
use companion_cache::config::Config;
use companion_cache::storage::disk::FileStore;
use companion_cache::storage::PersistentTier;
use companion_cache::CacheRuntime;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_across_concurrent_callers() {
    let h = harness(ScriptedOrigin::new().with_value("profile", "ada"));
    h.origin.hold();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move { coordinator.get("profile").await }));
    }
    h.origin.wait_for_calls(1).await;
    while h.store.metrics().coalesced_total.get() < 15 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    h.origin.release();

    for handle in handles {
        let lookup = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(lookup.value, "ada");
    }
    assert_eq!(h.origin.calls(), 1);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_shares_errors() {
    let origin = ScriptedOrigin::new();
    origin.fail_key("broken");
    let h = harness(origin);
    h.origin.hold();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move { coordinator.get("broken").await }));
    }
    h.origin.wait_for_calls(1).await;
    while h.store.metrics().coalesced_total.get() < 3 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    h.origin.release();

    let errors: Vec<StoreError> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap_err())
        .collect();
    assert!(errors.iter().all(|e| *e == errors[0]));
    assert_eq!(h.origin.calls(), 1);

    // A later call retries the origin.
    let _ = coordinator.get("broken").await;
    assert_eq!(h.origin.calls(), 2);
}

#[tokio::test]
async fn test_read_after_write_with_fetch_in_flight() {
    let h = harness(ScriptedOrigin::new().with_value("k", "stale-origin"));
    h.origin.hold();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let reader = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get("k").await })
    };
    h.origin.wait_for_calls(1).await;

    coordinator.set("k", "written".into(), "default").await.unwrap();
    assert_eq!(coordinator.get("k").await.unwrap().unwrap().value, "written");

    h.origin.release();
    reader.await.unwrap().unwrap();

    // The late origin value was not installed over the write.
    let after = coordinator.get("k").await.unwrap().unwrap();
    assert_eq!(after.value, "written");
    let persisted = h.durable.read("k").await.unwrap().unwrap();
    assert_eq!(persisted.payload, b"\"written\"".to_vec());
}

#[tokio::test]
async fn test_delete_with_fetch_in_flight_stays_deleted() {
    let h = harness(ScriptedOrigin::new().with_value("k", "origin"));
    h.origin.hold();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let reader = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get("k").await })
    };
    h.origin.wait_for_calls(1).await;
    coordinator.delete("k").await.unwrap();
    h.origin.release();
    reader.await.unwrap().unwrap();

    assert!(!h.store.in_memory("k"));
    assert!(!h.durable.inner.contains_entry("k"));
}

#[tokio::test]
async fn test_delete_during_write_through_stays_deleted() {
    let h = harness(ScriptedOrigin::new().with_value("k", "origin"));
    h.durable.hold_writes();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let reader = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get("k").await })
    };
    h.durable.wait_for_writes(1).await;
    coordinator.delete("k").await.unwrap();
    h.durable.release_writes();
    let lookup = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(lookup.value, "origin");

    assert!(!h.store.in_memory("k"));
    assert!(!h.durable.inner.contains_entry("k"));
}

#[tokio::test]
async fn test_set_during_write_through_wins() {
    let h = harness(ScriptedOrigin::new().with_value("k", "origin"));
    h.durable.hold_writes();
    let coordinator = Arc::new(RequestCoordinator::new(h.store.clone()));

    let reader = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get("k").await })
    };
    h.durable.wait_for_writes(1).await;
    let writer = {
        let store = h.store.clone();
        tokio::spawn(async move { store.set("k", "fresh".into(), "default").await })
    };
    h.durable.wait_for_writes(2).await;
    h.durable.release_writes();
    writer.await.unwrap().unwrap();
    reader.await.unwrap().unwrap();

    let persisted = h.durable.read("k").await.unwrap().unwrap();
    assert_eq!(persisted.payload, b"\"fresh\"".to_vec());
}

#[tokio::test]
async fn test_queued_writes_flush_after_recovery() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.data_dir = dir.path().to_path_buf();

    let durable = Arc::new(FlakyTier::new());
    let runtime: CacheRuntime<String> = CacheRuntime::build(
        config,
        durable.clone(),
        Arc::new(ScriptedOrigin::new()),
        Arc::new(companion_cache::cache::entry::SystemClock),
    )
    .await
    .unwrap();

    durable.set_fail_writes(true);
    runtime.set("draft", "hello".into(), "default").await.unwrap();
    assert_eq!(runtime.queue().count().await.unwrap(), 1);
    assert_eq!(runtime.sync_status().pending, 1);

    // Still offline: the write stays queued with a retry counted.
    let report = runtime.flush_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(runtime.queue().dequeue_all().await.unwrap()[0].retry_count, 1);

    durable.set_fail_writes(false);
    let report = runtime.flush_now().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert!(durable.inner.contains_entry("draft"));
    assert_eq!(runtime.queue().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.data_dir = dir.path().to_path_buf();

    {
        let durable = Arc::new(FileStore::open(dir.path().join("store")).await.unwrap());
        let runtime: CacheRuntime<String> =
            CacheRuntime::start(config.clone(), durable, Arc::new(ScriptedOrigin::new()))
                .await
                .unwrap();
        runtime.set("k", "persisted".into(), "default").await.unwrap();
        runtime.shutdown().await;
    }

    let durable = Arc::new(FileStore::open(dir.path().join("store")).await.unwrap());
    let runtime: CacheRuntime<String> =
        CacheRuntime::start(config, durable, Arc::new(ScriptedOrigin::new()))
            .await
            .unwrap();
    let hit = runtime.get("k").await.unwrap().unwrap();
    assert_eq!(hit.value, "persisted");
    assert_eq!(hit.source, Tier::Durable);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_learned_pattern_is_prefetched() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.data_dir = dir.path().to_path_buf();

    let clock = Arc::new(ManualClock::new(1_000_000));
    let origin = Arc::new(ScriptedOrigin::new().with_value("daily-summary", "summary"));
    let runtime: CacheRuntime<String> = CacheRuntime::build(
        config,
        Arc::new(FlakyTier::new()),
        origin.clone(),
        clock.clone() as Arc<dyn Clock>,
    )
    .await
    .unwrap();

    // Read on a regular cadence, dropping the value between reads.
    for _ in 0..5 {
        runtime.get("daily-summary").await.unwrap().unwrap();
        runtime.store().clear_memory();
        runtime.store().delete("daily-summary").await.unwrap();
        clock.advance(60_000);
    }
    let calls_before = origin.calls();

    let prefetcher = Prefetcher::new(runtime.coordinator().clone(), runtime.predictor().clone());
    let report = prefetcher.run_once().await;
    assert_eq!(report.issued, 1);
    assert_eq!(origin.calls(), calls_before + 1);

    let hit = runtime.get("daily-summary").await.unwrap().unwrap();
    assert_eq!(hit.source, Tier::Memory);
}
