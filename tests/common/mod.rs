//! Shared test fixtures: an in-memory MetaStore double and a scriptable
//! mock upstream.

// Each test binary uses a different slice of these fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use warden::blocking::{BlockFilter, BlockedResponse};
use warden::cache::{
    CacheKey, CacheLayer, CandidateCheck, HitBatcher, HitFlush, LocalCache, MetaStore,
};
use warden::clients::ClientDirectory;
use warden::dns::{DnsMessage, DnsQuestion, DnsRecord, RecordClass, RecordType, TtlPolicy, rcode};
use warden::error::Result;
use warden::events::{EventSink, TracingEventStore};
use warden::local_records::LocalRecords;
use warden::refresh::{RefreshEngine, RefreshTuning};
use warden::resolver::{RequestContext, Resolver};
use warden::safe_search::SafeSearch;
use warden::servfail::ServfailTracker;
use warden::upstream::{SelectionStrategy, Upstream, UpstreamManager};

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone)]
pub struct StoredEntry {
    pub data: Vec<u8>,
    pub soft_expiry: u64,
    pub created_at: u64,
}

/// In-memory MetaStore with the same observable semantics as the Redis
/// implementation, plus inspection hooks for assertions.
#[derive(Default)]
pub struct MemoryMetaStore {
    pub entries: Mutex<HashMap<String, StoredEntry>>,
    pub index: Mutex<HashMap<String, u64>>,
    pub hits: Mutex<HashMap<String, u64>>,
    pub sweep_hits: Mutex<HashMap<String, u64>>,
    pub locks: Mutex<HashMap<String, std::time::Instant>>,
    pub lock_acquires: AtomicU64,
}

impl MemoryMetaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an entry with full control over expiry and counters.
    pub fn insert_raw(&self, key: &str, data: Vec<u8>, soft_expiry: u64, sweep_hits: u64) {
        self.entries.lock().insert(
            key.to_string(),
            StoredEntry {
                data,
                soft_expiry,
                created_at: now_epoch(),
            },
        );
        self.index.lock().insert(key.to_string(), soft_expiry);
        if sweep_hits > 0 {
            self.sweep_hits.lock().insert(key.to_string(), sweep_hits);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn index_contains(&self, key: &str) -> bool {
        self.index.lock().contains_key(key)
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_with_ttl(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, i64)>> {
        let entries = self.entries.lock();
        Ok(entries.get(&key.redis_key()).map(|entry| {
            let remaining = entry.soft_expiry as i64 - now_epoch() as i64;
            (entry.data.clone(), remaining)
        }))
    }

    async fn set_with_index(&self, key: &CacheKey, answer: &[u8], ttl: u32) -> Result<()> {
        if ttl == 0 {
            return Ok(());
        }
        let redis_key = key.redis_key();
        let soft = now_epoch() + ttl as u64;
        self.entries.lock().insert(
            redis_key.clone(),
            StoredEntry {
                data: answer.to_vec(),
                soft_expiry: soft,
                created_at: now_epoch(),
            },
        );
        self.index.lock().insert(redis_key, soft);
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        self.index.lock().remove(key);
        Ok(())
    }

    async fn flush_hits(&self, hits: &[HitFlush], sweeps: &[HitFlush]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(hits.len());
        {
            let mut map = self.hits.lock();
            for flush in hits {
                let count = map.entry(flush.key.clone()).or_insert(0);
                *count += flush.count;
                counts.push(*count);
            }
        }
        {
            let mut map = self.sweep_hits.lock();
            for flush in sweeps {
                *map.entry(flush.key.clone()).or_insert(0) += flush.count;
            }
        }
        Ok(counts)
    }

    async fn try_acquire_refresh(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock();
        let lock_key = key.redis_key();
        let now = std::time::Instant::now();
        if let Some(expires) = locks.get(&lock_key) {
            if *expires > now {
                return Ok(false);
            }
        }
        locks.insert(lock_key, now + ttl);
        self.lock_acquires.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release_refresh(&self, key: &CacheKey) -> Result<()> {
        self.locks.lock().remove(&key.redis_key());
        Ok(())
    }

    async fn expiry_candidates(&self, until: u64, limit: usize) -> Result<Vec<(String, u64)>> {
        let index = self.index.lock();
        let mut candidates: Vec<(String, u64)> = index
            .iter()
            .filter(|(_, soft)| **soft <= until)
            .map(|(k, soft)| (k.clone(), *soft))
            .collect();
        candidates.sort_by_key(|(_, soft)| *soft);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn batch_candidate_checks(&self, keys: &[String]) -> Result<Vec<CandidateCheck>> {
        let entries = self.entries.lock();
        let sweep_hits = self.sweep_hits.lock();
        Ok(keys
            .iter()
            .map(|key| CandidateCheck {
                key: key.clone(),
                exists: entries.contains_key(key),
                sweep_hits: sweep_hits.get(key).copied().unwrap_or(0),
                created_at: entries.get(key).map(|e| e.created_at).unwrap_or(0),
            })
            .collect())
    }

    async fn remove_index_entries(&self, keys: &[String]) -> Result<usize> {
        let mut index = self.index.lock();
        let mut removed = 0;
        for key in keys {
            if index.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn reconcile_expiry_index(&self, _sample_size: usize) -> Result<usize> {
        let entries = self.entries.lock();
        let mut index = self.index.lock();
        let before = index.len();
        index.retain(|key, _| entries.contains_key(key));
        Ok(before - index.len())
    }

    async fn evict_to_cap(&self, max_keys: usize) -> Result<usize> {
        let count = self.index.lock().len();
        if count <= max_keys {
            return Ok(0);
        }
        let overage = count - max_keys;
        let keys: Vec<String> = {
            let index = self.index.lock();
            let entries = self.entries.lock();
            let sweep_hits = self.sweep_hits.lock();
            let mut ranked: Vec<(u64, u64, String)> = index
                .keys()
                .map(|k| {
                    (
                        sweep_hits.get(k).copied().unwrap_or(0),
                        entries.get(k).map(|e| e.created_at).unwrap_or(0),
                        k.clone(),
                    )
                })
                .collect();
            ranked.sort();
            ranked.into_iter().take(overage).map(|(_, _, k)| k).collect()
        };
        for key in &keys {
            self.remove_entry(key).await?;
        }
        Ok(keys.len())
    }

    async fn key_count(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    async fn count_below_threshold(&self, min_hits: u64) -> Result<usize> {
        let index = self.index.lock();
        let sweep_hits = self.sweep_hits.lock();
        Ok(index
            .keys()
            .filter(|k| sweep_hits.get(*k).copied().unwrap_or(0) < min_hits)
            .count())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        self.index.lock().clear();
        self.hits.lock().clear();
        self.sweep_hits.lock().clear();
        self.locks.lock().clear();
        Ok(())
    }
}

/// How the mock upstream answers.
#[derive(Clone)]
pub enum MockAnswer {
    A { addr: std::net::Ipv4Addr, ttl: u32 },
    Servfail,
}

/// Start a scripted UDP upstream; returns its address and a query counter.
pub async fn start_mock_upstream(answer: MockAnswer) -> (SocketAddr, Arc<AtomicU64>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock upstream");
    let addr = socket.local_addr().expect("mock upstream addr");
    let queries = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&queries);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(request) = DnsMessage::parse(&buf[..len]) else {
                continue;
            };
            let mut reply = DnsMessage::response_for(&request);
            match &answer {
                MockAnswer::A { addr, ttl } => {
                    if let Some(question) = request.first_question() {
                        reply
                            .answers
                            .push(DnsRecord::a(question.name.clone(), *addr, *ttl));
                    }
                }
                MockAnswer::Servfail => {
                    reply.header.rcode = rcode::SERVFAIL;
                }
            }
            if let Ok(bytes) = reply.to_bytes() {
                let _ = socket.send_to(&bytes, from).await;
            }
        }
    });

    (addr, queries)
}

/// Everything a pipeline test needs in one place.
pub struct Harness {
    pub resolver: Arc<Resolver>,
    pub refresh: Arc<RefreshEngine>,
    pub cache: Arc<CacheLayer>,
    pub store: Arc<MemoryMetaStore>,
    pub servfail: Arc<ServfailTracker>,
    pub batcher: HitBatcher,
    pub ctx: RequestContext,
    // Keeps the background workers' shutdown channel open for the test's
    // lifetime.
    _shutdown: tokio::sync::broadcast::Sender<()>,
}

pub struct HarnessOptions {
    pub upstream: SocketAddr,
    pub denylist: Vec<String>,
    pub block_rules: Vec<String>,
    pub blocked_response: BlockedResponse,
    pub blocked_ttl: u32,
    pub serve_stale: bool,
    pub stale_ttl: Duration,
    pub expired_entry_ttl: u32,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub servfail_backoff: Duration,
    pub hot_threshold: u64,
    pub local_records: Vec<String>,
    pub safe_search: bool,
    pub clients: Vec<String>,
    pub groups: Vec<String>,
}

impl HarnessOptions {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            denylist: Vec::new(),
            block_rules: Vec::new(),
            blocked_response: BlockedResponse::NxDomain,
            blocked_ttl: 3600,
            serve_stale: true,
            stale_ttl: Duration::from_secs(300),
            expired_entry_ttl: 30,
            min_ttl: 30,
            max_ttl: 3600,
            servfail_backoff: Duration::from_secs(60),
            hot_threshold: 10,
            local_records: Vec::new(),
            safe_search: false,
            clients: Vec::new(),
            groups: Vec::new(),
        }
    }
}

pub fn build_harness(store: Arc<MemoryMetaStore>, options: HarnessOptions) -> Harness {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let meta: Arc<dyn MetaStore> = store.clone();

    let cache = Arc::new(CacheLayer::new(
        LocalCache::new(1000),
        Some(meta.clone()),
        options.serve_stale,
        options.stale_ttl,
    ));

    let batcher = HitBatcher::spawn(meta.clone(), shutdown_tx.subscribe());

    let servfail = Arc::new(ServfailTracker::new(
        options.servfail_backoff,
        10,
        Duration::from_secs(60),
    ));

    let upstreams = Arc::new(
        UpstreamManager::new(
            vec![Upstream::parse(&options.upstream.to_string()).expect("mock upstream spec")],
            SelectionStrategy::Failover,
            Duration::from_secs(2),
            Duration::from_secs(30),
            false,
        )
        .expect("upstream manager"),
    );

    let ttl_policy = TtlPolicy {
        respect_source_ttl: false,
        min_ttl: options.min_ttl,
        max_ttl: options.max_ttl,
        negative_ttl: 300,
    };

    let refresh = Arc::new(RefreshEngine::new(
        Arc::clone(&cache),
        Some(meta.clone()),
        Arc::clone(&upstreams),
        Arc::clone(&servfail),
        Some(batcher.clone()),
        8,
        ttl_policy,
        RefreshTuning {
            hot_ttl: Duration::from_secs(300),
            hot_threshold: options.hot_threshold,
            min_ttl: options.min_ttl,
            hit_window: Duration::from_secs(60),
            sweep_hit_window: Duration::from_secs(72 * 3600),
            sample_rate: 1.0,
            lock_ttl: Duration::from_secs(30),
            fail_log_interval: Duration::from_secs(300),
        },
    ));

    let events = Arc::new(EventSink::new(
        Arc::new(TracingEventStore),
        256,
        1.0,
        Vec::new(),
        Vec::new(),
        warden::events::AnonymizeMode::None,
    ));

    let block_filter = BlockFilter::from_rules(
        options.block_rules.clone(),
        Vec::new(),
        options.denylist.clone(),
    );

    let resolver = Arc::new(Resolver::new(
        Arc::clone(&cache),
        Arc::clone(&refresh),
        Arc::clone(&servfail),
        upstreams,
        events,
        ttl_policy,
        options.expired_entry_ttl,
        block_filter,
        options.blocked_response,
        options.blocked_ttl,
        LocalRecords::from_entries(&options.local_records),
        SafeSearch::new(options.safe_search),
        ClientDirectory::from_entries(&options.clients, &options.groups),
        None,
    ));

    Harness {
        resolver,
        refresh,
        cache,
        store,
        servfail,
        batcher,
        ctx: RequestContext {
            client: "127.0.0.1:55353".parse().expect("client addr"),
            protocol: "udp",
        },
        _shutdown: shutdown_tx,
    }
}

pub fn query(name: &str, qtype: RecordType) -> Vec<u8> {
    DnsMessage::query(0x7777, DnsQuestion::new(name, qtype, RecordClass::IN))
        .to_bytes()
        .expect("encode query")
}

/// Encode a positive A answer the way cached entries are stored.
pub fn canned_answer(name: &str, addr: std::net::Ipv4Addr, ttl: u32) -> Vec<u8> {
    let request = DnsMessage::query(1, DnsQuestion::new(name, RecordType::A, RecordClass::IN));
    let mut reply = DnsMessage::response_for(&request);
    reply.answers.push(DnsRecord::a(name, addr, ttl));
    reply.to_bytes().expect("encode answer")
}
