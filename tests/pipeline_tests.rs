//! End-to-end pipeline scenarios against a scripted upstream and an
//! in-memory meta store.

mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    HarnessOptions, MemoryMetaStore, MockAnswer, build_harness, canned_answer, now_epoch, query,
    start_mock_upstream,
};
use warden::cache::CacheKey;
use warden::dns::{DnsMessage, DnsQuestion, RecordClass, RecordType, rcode};
use warden::events::QueryOutcome;

fn parse_reply(bytes: &[u8]) -> DnsMessage {
    DnsMessage::parse(bytes).expect("reply parses")
}

#[tokio::test]
async fn blocked_query_gets_nxdomain_with_soa() {
    let (upstream, upstream_queries) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 300 }).await;
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new(upstream);
    options.denylist = vec!["ads.test".to_string()];
    let harness = build_harness(store, options);

    let resolution = harness
        .resolver
        .resolve(&query("ads.test", RecordType::A), &harness.ctx)
        .await;

    assert_eq!(resolution.outcome, QueryOutcome::Blocked);
    assert_eq!(resolution.rcode, rcode::NXDOMAIN);

    let reply = parse_reply(&resolution.bytes);
    assert!(reply.is_nxdomain());
    assert_eq!(reply.authorities.len(), 1);
    let soa = &reply.authorities[0];
    assert_eq!(soa.rtype, RecordType::SOA);
    assert_eq!(soa.name, "ads.test");
    assert_eq!(soa.ttl, 3600);
    // MNAME of the synthesized SOA is ns.<zone>.
    let (mname, _) = warden::dns::name::parse_name(&soa.rdata, 0).expect("soa mname");
    assert_eq!(mname, "ns.ads.test");

    // Blocked queries never reach upstream.
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cold_miss_then_warm_hit() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(93, 184, 216, 34),
        ttl: 300,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    let first = harness
        .resolver
        .resolve(&query("example.com", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(first.outcome, QueryOutcome::Upstream);
    let reply = parse_reply(&first.bytes);
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(reply.answers[0].rdata, vec![93, 184, 216, 34]);
    assert_eq!(reply.answers[0].ttl, 300);

    // The cache write happens post-write.
    harness
        .resolver
        .finish(first, &harness.ctx, Duration::from_millis(1), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.contains("dns:example.com:1:1"));

    let second = harness
        .resolver
        .resolve(&query("example.com", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(second.outcome, QueryOutcome::Cached);
    let reply = parse_reply(&second.bytes);
    assert_eq!(reply.answers[0].rdata, vec![93, 184, 216, 34]);
    assert!(reply.answers[0].ttl <= 300);
    assert_eq!(reply.header.id, 0x7777);

    assert_eq!(upstream_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_serve_schedules_one_refresh() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(93, 184, 216, 34),
        ttl: 300,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    // Entry went past soft expiry 10 s ago, still within stale_ttl.
    store.insert_raw(
        "dns:stale.test:1:1",
        canned_answer("stale.test", Ipv4Addr::new(10, 0, 0, 1), 300),
        now_epoch() - 10,
        5,
    );

    let resolution = harness
        .resolver
        .resolve(&query("stale.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Stale);
    let reply = parse_reply(&resolution.bytes);
    // Stale replies carry the pinned short TTL.
    assert_eq!(reply.answers[0].ttl, 30);
    assert_eq!(reply.answers[0].rdata, vec![10, 0, 0, 1]);

    harness
        .resolver
        .finish(resolution, &harness.ctx, Duration::from_millis(1), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly one refresh ran: one lock acquisition, one upstream exchange,
    // and the entry is fresh again.
    assert_eq!(store.lock_acquires.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 1);
    let entry = store.entries.lock().get("dns:stale.test:1:1").cloned().unwrap();
    assert!(entry.soft_expiry > now_epoch());
}

#[tokio::test]
async fn servfail_backoff_short_circuits() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::Servfail).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store, HarnessOptions::new(upstream));

    let first = harness
        .resolver
        .resolve(&query("broken.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(first.outcome, QueryOutcome::Servfail);
    assert_eq!(first.rcode, rcode::SERVFAIL);
    assert!(first.upstream_address.is_some());

    for _ in 0..2 {
        let next = harness
            .resolver
            .resolve(&query("broken.test", RecordType::A), &harness.ctx)
            .await;
        assert_eq!(next.outcome, QueryOutcome::ServfailBackoff);
        assert_eq!(next.rcode, rcode::SERVFAIL);
        assert!(next.upstream_address.is_none());
    }

    // Only the first query touched upstream.
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 1);
    assert!(harness.servfail.in_backoff("dns:broken.test:1:1"));
}

#[tokio::test]
async fn refresh_lock_is_a_singleton_across_instances() {
    let (upstream, upstream_queries) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(10, 0, 0, 2),
        ttl: 300,
    })
    .await;
    let store = MemoryMetaStore::new();

    // Two resolver instances sharing one store, as two replicas would.
    let harness_a = build_harness(store.clone(), HarnessOptions::new(upstream));
    let harness_b = build_harness(store.clone(), HarnessOptions::new(upstream));

    let question = DnsQuestion::new("hot.test", RecordType::A, RecordClass::IN);
    let key = CacheKey::from_question(&question);

    let a = harness_a
        .refresh
        .clone()
        .schedule_refresh(question.clone(), key.clone());
    let b = harness_b.refresh.clone().schedule_refresh(question, key);
    // Both pass local admission; the distributed lock arbitrates.
    assert!(a && b);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.lock_acquires.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_queries.load(Ordering::SeqCst), 1);
    assert!(store.contains("dns:hot.test:1:1"));
}

#[tokio::test]
async fn upstream_error_returns_servfail() {
    // Point at a closed port; the UDP exchange times out.
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new("127.0.0.1:1".parse().unwrap());
    let harness = {
        options.serve_stale = false;
        build_harness(store, options)
    };

    let resolution = harness
        .resolver
        .resolve(&query("unreachable.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::UpstreamError);
    assert_eq!(resolution.rcode, rcode::SERVFAIL);
}

#[tokio::test]
async fn malformed_request_is_invalid() {
    let (upstream, _) =
        start_mock_upstream(MockAnswer::A { addr: Ipv4Addr::LOCALHOST, ttl: 60 }).await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store, HarnessOptions::new(upstream));

    let resolution = harness.resolver.resolve(&[0x12, 0x34], &harness.ctx).await;
    assert_eq!(resolution.outcome, QueryOutcome::Invalid);
    assert_eq!(resolution.rcode, rcode::FORMERR);

    // Zero questions is invalid too.
    let empty = DnsMessage::default().to_bytes().unwrap();
    let resolution = harness.resolver.resolve(&empty, &harness.ctx).await;
    assert_eq!(resolution.outcome, QueryOutcome::Invalid);
}

#[tokio::test]
async fn pause_blocking_lets_queries_through() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(10, 0, 0, 3),
        ttl: 120,
    })
    .await;
    let store = MemoryMetaStore::new();
    let mut options = HarnessOptions::new(upstream);
    options.denylist = vec!["ads.test".to_string()];
    let harness = build_harness(store, options);

    harness.resolver.pause_blocking(Duration::from_secs(60));
    let resolution = harness
        .resolver
        .resolve(&query("ads.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Upstream);

    harness.resolver.resume_blocking();
    let resolution = harness
        .resolver
        .resolve(&query("ads.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Blocked);
}

#[tokio::test]
async fn ttl_floor_applies_to_upstream_answers() {
    let (upstream, _) = start_mock_upstream(MockAnswer::A {
        addr: Ipv4Addr::new(10, 0, 0, 4),
        ttl: 5,
    })
    .await;
    let store = MemoryMetaStore::new();
    let harness = build_harness(store.clone(), HarnessOptions::new(upstream));

    let resolution = harness
        .resolver
        .resolve(&query("shortttl.test", RecordType::A), &harness.ctx)
        .await;
    assert_eq!(resolution.outcome, QueryOutcome::Upstream);
    harness
        .resolver
        .finish(resolution, &harness.ctx, Duration::from_millis(1), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Source TTL 5 is floored to min_ttl 30 in the cache.
    let entry = store
        .entries
        .lock()
        .get("dns:shortttl.test:1:1")
        .cloned()
        .expect("cached");
    let remaining = entry.soft_expiry as i64 - now_epoch() as i64;
    assert!(remaining > 25 && remaining <= 30, "remaining={}", remaining);
}
