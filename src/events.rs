//! Query event emission: sampled, filtered, optionally anonymized records
//! of every completed query, drained by a background worker into a
//! pluggable store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::fnv1a;
use crate::error::Result;

/// Terminal classification of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Local,
    SafeSearch,
    Blocked,
    Cached,
    Stale,
    ServfailBackoff,
    Upstream,
    Servfail,
    UpstreamError,
    Invalid,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Local => "local",
            QueryOutcome::SafeSearch => "safe_search",
            QueryOutcome::Blocked => "blocked",
            QueryOutcome::Cached => "cached",
            QueryOutcome::Stale => "stale",
            QueryOutcome::ServfailBackoff => "servfail_backoff",
            QueryOutcome::Upstream => "upstream",
            QueryOutcome::Servfail => "servfail",
            QueryOutcome::UpstreamError => "upstream_error",
            QueryOutcome::Invalid => "invalid",
        }
    }
}

/// Client IP treatment before an event leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymizeMode {
    None,
    /// Zero the host bits: /24 for IPv4, /48 for IPv6.
    Truncate,
    /// Replace with a stable hash.
    Hash,
}

impl AnonymizeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(AnonymizeMode::None),
            "truncate" => Some(AnonymizeMode::Truncate),
            "hash" => Some(AnonymizeMode::Hash),
            _ => None,
        }
    }

    pub fn apply(&self, ip: &str) -> String {
        match self {
            AnonymizeMode::None => ip.to_string(),
            AnonymizeMode::Truncate => truncate_ip(ip),
            AnonymizeMode::Hash => format!("{:016x}", fnv1a(ip.as_bytes())),
        }
    }
}

fn truncate_ip(ip: &str) -> String {
    if let Ok(v4) = ip.parse::<std::net::Ipv4Addr>() {
        let octets = v4.octets();
        return format!("{}.{}.{}.0", octets[0], octets[1], octets[2]);
    }
    if let Ok(v6) = ip.parse::<std::net::Ipv6Addr>() {
        let segments = v6.segments();
        return format!("{:x}:{:x}:{:x}::", segments[0], segments[1], segments[2]);
    }
    ip.to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    pub ts: DateTime<Utc>,
    pub client_ip: String,
    pub client_name: Option<String>,
    pub protocol: &'static str,
    pub qname: String,
    pub qtype: String,
    pub qclass: String,
    pub outcome: QueryOutcome,
    pub rcode: u8,
    pub duration_ms: f64,
    pub cache_lookup_ms: f64,
    pub network_write_ms: f64,
    pub upstream_address: Option<String>,
}

/// Destination for drained events. External analytical stores are plugged
/// in here; the default writes structured log lines.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store(&self, event: &QueryEvent) -> Result<()>;
}

pub struct TracingEventStore;

#[async_trait]
impl EventStore for TracingEventStore {
    async fn store(&self, event: &QueryEvent) -> Result<()> {
        info!(
            target: "warden::query",
            client = %event.client_ip,
            qname = %event.qname,
            qtype = %event.qtype,
            outcome = event.outcome.as_str(),
            rcode = event.rcode,
            duration_ms = event.duration_ms,
            upstream = event.upstream_address.as_deref().unwrap_or("-"),
            "query"
        );
        Ok(())
    }
}

/// `query_store_stats()` payload.
#[derive(Debug, Clone, Serialize)]
pub struct QueryStoreStats {
    pub buffer_used: usize,
    pub dropped_total: u64,
}

struct SinkFilters {
    sample_rate: f64,
    exclude_domains: Vec<String>,
    exclude_clients: Vec<String>,
    anonymize: AnonymizeMode,
}

pub struct EventSink {
    tx: mpsc::Sender<QueryEvent>,
    dropped: AtomicU64,
    filters: SinkFilters,
    /// Domain globs that force emission regardless of sampling.
    trace_domains: RwLock<Arc<Vec<String>>>,
}

impl EventSink {
    pub fn new(
        store: Arc<dyn EventStore>,
        buffer: usize,
        sample_rate: f64,
        exclude_domains: Vec<String>,
        exclude_clients: Vec<String>,
        anonymize: AnonymizeMode,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(drain(rx, store));
        Self {
            tx,
            dropped: AtomicU64::new(0),
            filters: SinkFilters {
                sample_rate,
                exclude_domains,
                exclude_clients,
                anonymize,
            },
            trace_domains: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn set_trace_domains(&self, domains: Vec<String>) {
        *self.trace_domains.write() = Arc::new(domains);
    }

    /// Apply filters and sampling, then enqueue without blocking. A full
    /// buffer drops the event and bumps the counter.
    pub fn record(&self, mut event: QueryEvent) {
        let traced = {
            let trace = self.trace_domains.read().clone();
            trace.iter().any(|p| glob_match(p, &event.qname))
        };

        if !traced {
            if self
                .filters
                .exclude_domains
                .iter()
                .any(|p| glob_match(p, &event.qname))
            {
                return;
            }
            let client_name = event.client_name.as_deref().unwrap_or("");
            if self
                .filters
                .exclude_clients
                .iter()
                .any(|p| glob_match(p, &event.client_ip) || glob_match(p, client_name))
            {
                return;
            }
            if self.filters.sample_rate < 1.0 && rand::random::<f64>() >= self.filters.sample_rate
            {
                return;
            }
        }

        event.client_ip = self.filters.anonymize.apply(&event.client_ip);

        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> QueryStoreStats {
        QueryStoreStats {
            buffer_used: self.tx.max_capacity() - self.tx.capacity(),
            dropped_total: self.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<QueryEvent>, store: Arc<dyn EventStore>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = store.store(&event).await {
            debug!("Event store write failed: {}", err);
        }
    }
}

/// Minimal glob: `*` matches any run, `?` one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
