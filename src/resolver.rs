//! The request pipeline: local records → safe search → blocklist → cache →
//! SERVFAIL gate → upstream, with post-write work (counters, refresh, cache
//! population) kept strictly off the user-visible path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::blocking::{BlockFilter, BlockedResponse, blocked_reply};
use crate::cache::{CacheKey, CacheLayer, CacheLookup, CacheStatsSnapshot};
use crate::clients::ClientDirectory;
use crate::dns::{DnsMessage, DnsQuestion, DnsRecord, RecordType, TtlPolicy, rcode};
use crate::error::Result;
use crate::events::{EventSink, QueryEvent, QueryOutcome, QueryStoreStats};
use crate::local_records::LocalRecords;
use crate::refresh::RefreshEngine;
use crate::safe_search::SafeSearch;
use crate::servfail::ServfailTracker;
use crate::upstream::{SelectionStrategy, Upstream, UpstreamConfigSnapshot, UpstreamManager};
use crate::webhook::WebhookNotifier;

const SAFE_SEARCH_TTL: u32 = 300;

#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub client: SocketAddr,
    pub protocol: &'static str,
}

/// What `resolve` hands back: the wire bytes to write, the terminal
/// classification, and any work that must happen only after the client
/// write completes.
pub struct Resolution {
    pub bytes: Vec<u8>,
    pub outcome: QueryOutcome,
    pub rcode: u8,
    pub upstream_address: Option<String>,
    pub cache_lookup_ms: f64,
    /// EDNS-advertised payload size; UDP replies above it are truncated.
    pub udp_payload_limit: usize,
    qname: String,
    qtype: String,
    qclass: String,
    client_name: Option<String>,
    post: Option<PostServe>,
}

enum PostServe {
    CacheHit {
        question: DnsQuestion,
        key: CacheKey,
        remaining: u32,
        was_stale: bool,
    },
    StoreAnswer {
        key: CacheKey,
        answer: DnsMessage,
        ttl: u32,
    },
}

/// Process-wide resolver state. Reconfigurable pieces are immutable
/// snapshots swapped under writer locks; the hot path clones an `Arc` once
/// per request.
pub struct Resolver {
    cache: Arc<CacheLayer>,
    refresh: Arc<RefreshEngine>,
    servfail: Arc<ServfailTracker>,
    upstreams: Arc<UpstreamManager>,
    events: Arc<EventSink>,
    ttl_policy: TtlPolicy,
    expired_entry_ttl: u32,
    block_filter: RwLock<Arc<BlockFilter>>,
    blocked_response: RwLock<(BlockedResponse, u32)>,
    pause_until: Mutex<Option<Instant>>,
    local_records: RwLock<Arc<LocalRecords>>,
    safe_search: RwLock<Arc<SafeSearch>>,
    clients: RwLock<Arc<ClientDirectory>>,
    webhook: Option<Arc<WebhookNotifier>>,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<CacheLayer>,
        refresh: Arc<RefreshEngine>,
        servfail: Arc<ServfailTracker>,
        upstreams: Arc<UpstreamManager>,
        events: Arc<EventSink>,
        ttl_policy: TtlPolicy,
        expired_entry_ttl: u32,
        block_filter: BlockFilter,
        blocked_response: BlockedResponse,
        blocked_ttl: u32,
        local_records: LocalRecords,
        safe_search: SafeSearch,
        clients: ClientDirectory,
        webhook: Option<Arc<WebhookNotifier>>,
    ) -> Self {
        Self {
            cache,
            refresh,
            servfail,
            upstreams,
            events,
            ttl_policy,
            expired_entry_ttl: expired_entry_ttl.max(1),
            block_filter: RwLock::new(Arc::new(block_filter)),
            blocked_response: RwLock::new((blocked_response, blocked_ttl)),
            pause_until: Mutex::new(None),
            local_records: RwLock::new(Arc::new(local_records)),
            safe_search: RwLock::new(Arc::new(safe_search)),
            clients: RwLock::new(Arc::new(clients)),
            webhook,
        }
    }

    /// Run one query through the pipeline. Never performs the client write;
    /// the caller writes `bytes` and then calls [`Resolver::finish`].
    pub async fn resolve(&self, wire: &[u8], ctx: &RequestContext) -> Resolution {
        let request = match DnsMessage::parse(wire) {
            Ok(request) if request.questions.len() == 1 && !request.header.qr => request,
            Ok(request) => {
                debug!(
                    "Rejecting request with {} questions from {}",
                    request.questions.len(),
                    ctx.client
                );
                return invalid_resolution(&request);
            }
            Err(err) => {
                debug!("Unparseable request from {}: {}", ctx.client, err);
                return invalid_raw_resolution(wire);
            }
        };

        let question = request.questions[0].clone();
        let normalized = question.normalized_name();
        let key = CacheKey::from_question(&question);

        let clients = self.clients.read().clone();
        let client_info = clients.identify(&ctx.client.ip()).cloned();
        let client_name = client_info.as_ref().map(|c| c.name.clone());
        let group_policy = client_info
            .as_ref()
            .and_then(|c| c.group.as_deref())
            .and_then(|g| clients.group_policy(g));

        let base = {
            let qname = normalized.clone();
            let qtype = question.qtype.to_string();
            let qclass = u16::from(question.qclass).to_string();
            let client_name = client_name.clone();
            let udp_payload_limit = request.edns_udp_size();
            move |reply: &DnsMessage, outcome: QueryOutcome| Resolution {
                bytes: Vec::new(),
                outcome,
                rcode: reply.header.rcode,
                upstream_address: None,
                cache_lookup_ms: 0.0,
                udp_payload_limit,
                qname: qname.clone(),
                qtype: qtype.clone(),
                qclass: qclass.clone(),
                client_name: client_name.clone(),
                post: None,
            }
        };

        // 1. Local override records answer authoritatively, even offline.
        {
            let local = self.local_records.read().clone();
            if let Some(records) = local.lookup(&normalized, question.qtype) {
                let mut reply = DnsMessage::response_for(&request);
                reply.header.aa = true;
                reply.answers = records.to_vec();
                let mut resolution = base(&reply, QueryOutcome::Local);
                resolution.bytes = encode_or_servfail(&request, reply);
                return resolution;
            }
        }

        // 2. Safe-search rewrite, unless the client's group opted out.
        if matches!(question.qtype, RecordType::A | RecordType::AAAA) {
            let group_allows = group_policy.map(|g| g.safe_search).unwrap_or(true);
            if group_allows {
                let safe_search = self.safe_search.read().clone();
                if let Some(target) = safe_search.rewrite_target(&normalized) {
                    let mut reply = DnsMessage::response_for(&request);
                    if let Ok(cname) =
                        DnsRecord::cname(question.name.clone(), target, SAFE_SEARCH_TTL)
                    {
                        reply.answers.push(cname);
                    }
                    let mut resolution = base(&reply, QueryOutcome::SafeSearch);
                    resolution.bytes = encode_or_servfail(&request, reply);
                    return resolution;
                }
            }
        }

        // 3. Blocklist: group-specific filter when one exists, else global.
        if !self.is_paused() {
            let blocked = match group_policy.and_then(|g| g.blocklist.as_ref()) {
                Some(group_filter) => group_filter.is_blocked(&normalized),
                None => self.block_filter.read().is_blocked(&normalized),
            };
            if blocked {
                let (mode, blocked_ttl) = *self.blocked_response.read();
                let reply = blocked_reply(&request, &normalized, question.qtype, mode, blocked_ttl)
                    .unwrap_or_else(|_| {
                        DnsMessage::failure_response(&request, rcode::SERVFAIL)
                    });
                if let Some(webhook) = &self.webhook {
                    webhook.notify_block(&normalized, &ctx.client.ip().to_string());
                }
                let mut resolution = base(&reply, QueryOutcome::Blocked);
                resolution.bytes = encode_or_servfail(&request, reply);
                return resolution;
            }
        }

        // 4. Two-tier cache.
        let lookup_started = Instant::now();
        let lookup = self.cache.lookup(&key).await;
        let cache_lookup_ms = lookup_started.elapsed().as_secs_f64() * 1000.0;

        match lookup {
            CacheLookup::Fresh { mut answer, remaining } => {
                answer.retarget(&request);
                answer.rewrite_ttls(remaining);
                let mut resolution = base(&answer, QueryOutcome::Cached);
                resolution.cache_lookup_ms = cache_lookup_ms;
                resolution.post = Some(PostServe::CacheHit {
                    question,
                    key,
                    remaining,
                    was_stale: false,
                });
                resolution.bytes = encode_or_servfail(&request, answer);
                return resolution;
            }
            CacheLookup::Stale { mut answer, .. } => {
                answer.retarget(&request);
                answer.rewrite_ttls(self.expired_entry_ttl);
                let mut resolution = base(&answer, QueryOutcome::Stale);
                resolution.cache_lookup_ms = cache_lookup_ms;
                resolution.post = Some(PostServe::CacheHit {
                    question,
                    key,
                    remaining: 0,
                    was_stale: true,
                });
                resolution.bytes = encode_or_servfail(&request, answer);
                return resolution;
            }
            CacheLookup::Miss => {}
        }

        // 5. SERVFAIL backoff gate: recent upstream SERVFAIL for this key
        // short-circuits without touching upstream again.
        let redis_key = key.redis_key();
        if self.servfail.in_backoff(&redis_key) {
            let reply = DnsMessage::failure_response(&request, rcode::SERVFAIL);
            let mut resolution = base(&reply, QueryOutcome::ServfailBackoff);
            resolution.cache_lookup_ms = cache_lookup_ms;
            resolution.bytes = encode_or_servfail(&request, reply);
            return resolution;
        }

        // 6. Upstream exchange. The original request is forwarded so EDNS
        // additions survive.
        match self.upstreams.exchange(&request).await {
            Ok(outcome) if outcome.response.is_servfail() => {
                let record = self.servfail.record(&redis_key);
                if record.should_log {
                    warn!(
                        "Upstream SERVFAIL for {} via {} (consecutive: {})",
                        redis_key, outcome.upstream, record.count
                    );
                }
                let mut reply = outcome.response;
                reply.retarget(&request);
                let mut resolution = base(&reply, QueryOutcome::Servfail);
                resolution.cache_lookup_ms = cache_lookup_ms;
                resolution.upstream_address = Some(outcome.upstream);
                resolution.bytes = encode_or_servfail(&request, reply);
                resolution
            }
            Ok(outcome) => {
                self.servfail.clear(&redis_key);
                let mut reply = outcome.response;
                reply.retarget(&request);
                let ttl = self.ttl_policy.effective_ttl(&reply);
                let mut resolution = base(&reply, QueryOutcome::Upstream);
                resolution.cache_lookup_ms = cache_lookup_ms;
                resolution.upstream_address = Some(outcome.upstream);
                if ttl > 0 {
                    resolution.post = Some(PostServe::StoreAnswer {
                        key,
                        answer: reply.clone(),
                        ttl,
                    });
                }
                resolution.bytes = encode_or_servfail(&request, reply);
                resolution
            }
            Err(err) => {
                warn!("Upstream exchange failed for {}: {}", redis_key, err);
                let reply = DnsMessage::failure_response(&request, rcode::SERVFAIL);
                let mut resolution = base(&reply, QueryOutcome::UpstreamError);
                resolution.cache_lookup_ms = cache_lookup_ms;
                resolution.bytes = encode_or_servfail(&request, reply);
                resolution
            }
        }
    }

    /// Called after the client write completes. Emits the query event with
    /// the already-captured durations and fires the post-write work as
    /// detached tasks with their own deadlines; nothing here can stretch
    /// `duration_ms`.
    pub fn finish(
        &self,
        resolution: Resolution,
        ctx: &RequestContext,
        duration: Duration,
        network_write: Duration,
    ) {
        self.events.record(QueryEvent {
            ts: chrono::Utc::now(),
            client_ip: ctx.client.ip().to_string(),
            client_name: resolution.client_name.clone(),
            protocol: ctx.protocol,
            qname: resolution.qname.clone(),
            qtype: resolution.qtype.clone(),
            qclass: resolution.qclass.clone(),
            outcome: resolution.outcome,
            rcode: resolution.rcode,
            duration_ms: duration.as_secs_f64() * 1000.0,
            cache_lookup_ms: resolution.cache_lookup_ms,
            network_write_ms: network_write.as_secs_f64() * 1000.0,
            upstream_address: resolution.upstream_address.clone(),
        });

        match resolution.post {
            Some(PostServe::CacheHit {
                question,
                key,
                remaining,
                was_stale,
            }) => {
                let refresh = Arc::clone(&self.refresh);
                tokio::spawn(async move {
                    refresh.after_hit(question, key, remaining, was_stale).await;
                });
            }
            Some(PostServe::StoreAnswer { key, answer, ttl }) => {
                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    cache.store(&key, &answer, ttl).await;
                });
            }
            None => {}
        }
    }

    // --- control operations (hot reload) ---

    pub fn apply_blocklist(&self, filter: BlockFilter) {
        *self.block_filter.write() = Arc::new(filter);
    }

    pub fn apply_response(&self, mode: BlockedResponse, blocked_ttl: u32) {
        *self.blocked_response.write() = (mode, blocked_ttl);
    }

    pub fn apply_local_records(&self, records: LocalRecords) {
        *self.local_records.write() = Arc::new(records);
    }

    pub fn apply_safe_search(&self, safe_search: SafeSearch) {
        *self.safe_search.write() = Arc::new(safe_search);
    }

    pub fn apply_client_identification(&self, clients: ClientDirectory) {
        *self.clients.write() = Arc::new(clients);
    }

    pub fn apply_upstreams(&self, upstreams: Vec<Upstream>, strategy: SelectionStrategy) {
        self.upstreams.apply_upstreams(upstreams, strategy);
    }

    pub fn set_trace_events(&self, domains: Vec<String>) {
        self.events.set_trace_domains(domains);
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear().await
    }

    pub fn pause_blocking(&self, duration: Duration) {
        *self.pause_until.lock() = Some(Instant::now() + duration);
    }

    pub fn resume_blocking(&self) {
        *self.pause_until.lock() = None;
    }

    pub fn is_paused(&self) -> bool {
        match *self.pause_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    // --- observability ---

    pub async fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.cache_stats().await
    }

    pub fn query_store_stats(&self) -> QueryStoreStats {
        self.events.stats()
    }

    pub fn upstream_config(&self) -> UpstreamConfigSnapshot {
        self.upstreams.upstream_config()
    }
}

fn encode_or_servfail(request: &DnsMessage, reply: DnsMessage) -> Vec<u8> {
    match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to encode reply: {}", err);
            DnsMessage::failure_response(request, rcode::SERVFAIL)
                .to_bytes()
                .unwrap_or_default()
        }
    }
}

fn invalid_resolution(request: &DnsMessage) -> Resolution {
    let reply = DnsMessage::failure_response(request, rcode::FORMERR);
    Resolution {
        bytes: reply.to_bytes().unwrap_or_default(),
        outcome: QueryOutcome::Invalid,
        rcode: rcode::FORMERR,
        upstream_address: None,
        cache_lookup_ms: 0.0,
        udp_payload_limit: 512,
        qname: request
            .first_question()
            .map(|q| q.normalized_name())
            .unwrap_or_default(),
        qtype: request
            .first_question()
            .map(|q| q.qtype.to_string())
            .unwrap_or_default(),
        qclass: String::new(),
        client_name: None,
        post: None,
    }
}

/// The request did not even parse; answer FORMERR with the id when the
/// header survived, otherwise id 0.
fn invalid_raw_resolution(wire: &[u8]) -> Resolution {
    let id = crate::dns::DnsHeader::parse(wire)
        .map(|h| h.id)
        .unwrap_or(0);
    let mut reply = DnsMessage::default();
    reply.header.id = id;
    reply.header.qr = true;
    reply.header.rcode = rcode::FORMERR;
    Resolution {
        bytes: reply.to_bytes().unwrap_or_default(),
        outcome: QueryOutcome::Invalid,
        rcode: rcode::FORMERR,
        upstream_address: None,
        cache_lookup_ms: 0.0,
        udp_payload_limit: 512,
        qname: String::new(),
        qtype: String::new(),
        qclass: String::new(),
        client_name: None,
        post: None,
    }
}
