//! Sweeper behavior: cold-key eviction, refresh scheduling, orphan cleanup,
//! and capacity eviction, driven one sweep at a time.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    HarnessOptions, MemoryMetaStore, MockAnswer, build_harness, canned_answer, now_epoch,
    start_mock_upstream,
};
use warden::refresh::sweeper::{SweepConfig, Sweeper};

fn sweep_config() -> SweepConfig {
    SweepConfig {
        interval: Duration::from_secs(15),
        window: Duration::from_secs(60),
        min_hits: 2,
        max_batch_size: 100,
        reconcile_interval: 0,
        deletion_candidates_interval: 1,
        max_keys: 0,
    }
}

fn build_sweeper(
    harness: &common::Harness,
    store: Arc<MemoryMetaStore>,
    config: SweepConfig,
) -> Sweeper {
    Sweeper::new(
        Arc::clone(&harness.refresh),
        store,
        Arc::clone(&harness.cache),
        Arc::clone(&harness.servfail),
        harness.batcher.clone(),
        config,
    )
}

#[tokio::test]
async fn cold_keys_deleted_warm_keys_refreshed() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(10, 9, 9, 9),
        ttl: 300,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    // a and b were served twice each inside the sweep window; c never was.
    let soon = now_epoch() + 20;
    store.insert_raw("dns:a.test:1:1", canned_answer("a.test", Ipv4Addr::LOCALHOST, 300), soon, 2);
    store.insert_raw("dns:b.test:1:1", canned_answer("b.test", Ipv4Addr::LOCALHOST, 300), soon, 2);
    store.insert_raw("dns:c.test:1:1", canned_answer("c.test", Ipv4Addr::LOCALHOST, 300), soon, 0);

    let sweeper = build_sweeper(&harness, store.clone(), sweep_config());
    sweeper.sweep().await.expect("sweep");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // c is gone from both the answers and the index.
    assert!(!store.contains("dns:c.test:1:1"));
    assert!(!store.index_contains("dns:c.test:1:1"));

    // a and b were refreshed through upstream and still exist.
    assert!(store.contains("dns:a.test:1:1"));
    assert!(store.contains("dns:b.test:1:1"));
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 2);

    let stats = sweeper.refresh_stats();
    assert_eq!(stats.last_candidates, 3);
    assert_eq!(stats.last_refreshed, 2);
    assert_eq!(stats.last_removed, 1);
    assert!(stats.last_sweep > 0);
}

#[tokio::test]
async fn orphaned_index_entries_are_dropped() {
    let (upstream, _) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 300 }).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    // Index entry with no backing key.
    store
        .index
        .lock()
        .insert("dns:ghost.test:1:1".to_string(), now_epoch() + 10);

    let sweeper = build_sweeper(&harness, store.clone(), sweep_config());
    sweeper.sweep().await.expect("sweep");

    assert!(!store.index_contains("dns:ghost.test:1:1"));
}

#[tokio::test]
async fn servfail_keys_are_skipped() {
    let (upstream, upstream_queries) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 300 }).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    store.insert_raw(
        "dns:flaky.test:1:1",
        canned_answer("flaky.test", Ipv4Addr::LOCALHOST, 300),
        now_epoch() + 20,
        5,
    );
    harness.servfail.record("dns:flaky.test:1:1");

    let sweeper = build_sweeper(&harness, store.clone(), sweep_config());
    sweeper.sweep().await.expect("sweep");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Still cached, but no refresh was attempted.
    assert!(store.contains("dns:flaky.test:1:1"));
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 0);
    assert_eq!(sweeper.refresh_stats().last_servfail_skipped, 1);
}

#[tokio::test]
async fn capacity_eviction_prefers_cold_then_old() {
    let (upstream, _) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 300 }).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    // Far-future expiries keep these out of the candidate window.
    let far = now_epoch() + 3600;
    store.insert_raw("dns:cold.test:1:1", canned_answer("cold.test", Ipv4Addr::LOCALHOST, 300), far, 0);
    store.insert_raw("dns:warm.test:1:1", canned_answer("warm.test", Ipv4Addr::LOCALHOST, 300), far, 5);
    store.insert_raw("dns:hot.test:1:1", canned_answer("hot.test", Ipv4Addr::LOCALHOST, 300), far, 50);

    let mut config = sweep_config();
    config.max_keys = 2;
    let sweeper = build_sweeper(&harness, store.clone(), config);
    sweeper.sweep().await.expect("sweep");

    // The lowest-sweep-hit key went first.
    assert!(!store.contains("dns:cold.test:1:1"));
    assert!(store.contains("dns:warm.test:1:1"));
    assert!(store.contains("dns:hot.test:1:1"));
}

#[tokio::test]
async fn deletion_candidates_gauge_updates() {
    let (upstream, _) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 300 }).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    let far = now_epoch() + 3600;
    store.insert_raw("dns:one.test:1:1", canned_answer("one.test", Ipv4Addr::LOCALHOST, 300), far, 0);
    store.insert_raw("dns:two.test:1:1", canned_answer("two.test", Ipv4Addr::LOCALHOST, 300), far, 9);

    let sweeper = build_sweeper(&harness, store.clone(), sweep_config());
    sweeper.sweep().await.expect("sweep");

    // One key sits below min_hits = 2.
    assert_eq!(sweeper.refresh_stats().deletion_candidates, 1);
}
