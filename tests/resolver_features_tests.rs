//! Local records, safe search, client groups, and control operations.

mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{HarnessOptions, MemoryMetaStore, MockAnswer, build_harness, query, start_mock_upstream};
use warden::blocking::BlockFilter;
use warden::dns::{DnsMessage, RecordType, name};
use warden::events::QueryOutcome;
use warden::local_records::LocalRecords;
use warden::resolver::RequestContext;

#[tokio::test]
async fn local_records_answer_without_upstream() {
    let (upstream, upstream_queries) =
        start_mock_upstream(MockAnswer::Servfail).await;
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new(upstream);
    options.local_records = vec!["router.lan:A:192.168.1.1:600".to_string()];
    let harness = build_harness(store, options);

    let resolution = harness
        .resolver
        .resolve(&query("router.lan", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Local);

    let reply = DnsMessage::parse(&resolution.bytes).unwrap();
    assert!(reply.header.aa);
    assert_eq!(reply.answers[0].rdata, vec![192, 168, 1, 1]);
    assert_eq!(reply.answers[0].ttl, 600);
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn safe_search_rewrites_to_cname() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::LOCALHOST,
        ttl: 60,
    })
    .await;
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new(upstream);
    options.safe_search = true;
    let harness = build_harness(store, options);

    let resolution = harness
        .resolver
        .resolve(&query("www.google.com", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::SafeSearch);

    let reply = DnsMessage::parse(&resolution.bytes).unwrap();
    assert_eq!(reply.answers[0].rtype, RecordType::CNAME);
    let (target, _) = name::parse_name(&reply.answers[0].rdata, 0).unwrap();
    assert_eq!(target, "forcesafesearch.google.com");
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 0);

    // TXT queries pass through untouched.
    let resolution = harness
        .resolver
        .resolve(&query("www.google.com", RecordType::TXT), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Upstream);
}

#[tokio::test]
async fn group_can_bypass_safe_search() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::LOCALHOST,
        ttl: 60,
    })
    .await;
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new(upstream);
    options.safe_search = true;
    options.clients = vec!["10.1.1.5=tv@adults".to_string()];
    options.groups = vec!["adults:safe_search=off".to_string()];
    let harness = build_harness(store, options);

    // The opted-out client goes straight to upstream.
    let adult_ctx = RequestContext {
        client: "10.1.1.5:40000".parse().unwrap(),
        protocol: "udp",
    };
    let resolution = harness
        .resolver
        .resolve(&query("www.google.com", RecordType::A), &adult_ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Upstream);

    // Unknown clients still get the rewrite.
    let resolution = harness
        .resolver
        .resolve(&query("www.google.com", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::SafeSearch);
}

#[tokio::test]
async fn blocklist_reload_swaps_atomically() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::LOCALHOST,
        ttl: 60,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store, HarnessOptions::new(upstream));

    let resolution = harness
        .resolver
        .resolve(&query("newly-bad.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Upstream);

    harness.resolver.apply_blocklist(BlockFilter::from_rules(
        vec!["newly-bad.test".to_string()],
        Vec::new(),
        Vec::new(),
    ));

    let resolution = harness
        .resolver
        .resolve(&query("newly-bad.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Blocked);
}

#[tokio::test]
async fn local_records_reload() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::LOCALHOST,
        ttl: 60,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store, HarnessOptions::new(upstream));

    let resolution = harness
        .resolver
        .resolve(&query("printer.lan", RecordType::A), &harness.ctx)
        .await;
    assert_ne!(resolution.outcome, QueryOutcome::Local);

    harness
        .resolver
        .apply_local_records(LocalRecords::from_entries(&[
            "printer.lan:A:10.0.0.40".to_string()
        ]));

    let resolution = harness
        .resolver
        .resolve(&query("printer.lan", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Local);
}

#[tokio::test]
async fn clear_cache_forces_next_query_upstream() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(10, 2, 2, 2),
        ttl: 300,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    let first = harness
        .resolver
        .resolve(&query("cachetest.test", RecordType::A), &harness.ctx)
        .await;
    harness
        .resolver
        .finish(first, &harness.ctx, Duration::from_millis(1), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cached = harness
        .resolver
        .resolve(&query("cachetest.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(cached.outcome, QueryOutcome::Cached);

    harness.resolver.clear_cache().await.unwrap();
    assert!(!store.contains("dns:cachetest.test:1:1"));

    let after = harness
        .resolver
        .resolve(&query("cachetest.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(after.outcome, QueryOutcome::Upstream);
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn observability_snapshots_are_populated() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::LOCALHOST,
        ttl: 60,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store, HarnessOptions::new(upstream));

    let upstream_config = harness.resolver.upstream_config();
    assert_eq!(upstream_config.upstreams.len(), 1);

    let cache_stats = harness.resolver.cache_stats().await;
    assert_eq!(cache_stats.hits, 0);
    assert_eq!(cache_stats.l0.max, 1000);

    let store_stats = harness.resolver.query_store_stats();
    assert_eq!(store_stats.dropped_total, 0);
}
