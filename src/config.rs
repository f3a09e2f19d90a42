use std::net::SocketAddr;
use std::time::Duration;

use crate::blocking::BlockedResponse;
use crate::error::{Result, WardenError};
use crate::events::AnonymizeMode;
use crate::upstream::{SelectionStrategy, Upstream};

/// Resolver configuration, environment-driven: every knob can be set via a
/// `WARDEN_*` variable, with defaults matching a small deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address for the UDP and TCP listeners
    pub bind_addr: SocketAddr,

    /// Number of concurrent UDP receive loops on the shared socket
    pub udp_listeners: usize,

    /// Idle timeout for client TCP connections
    pub tcp_idle_timeout: Duration,

    /// Upstream forwarders in configured order
    pub upstreams: Vec<Upstream>,

    /// Upstream selection strategy
    pub upstream_strategy: SelectionStrategy,

    /// Timeout for one upstream exchange
    pub upstream_timeout: Duration,

    /// How long a failed upstream is skipped
    pub upstream_backoff: Duration,

    /// Probe pooled TCP connections before reuse
    pub probe_pooled_connections: bool,

    /// Maximum number of L0 entries
    pub l0_max_entries: usize,

    /// L0 shard count
    pub l0_shards: usize,

    /// Redis endpoint; None runs with the in-process cache only
    pub redis_url: Option<String>,

    /// Hash-tag meta keys for cluster/sentinel topologies
    pub redis_cluster_mode: bool,

    /// TTL floor applied unless the source TTL is respected (0 disables)
    pub min_ttl: u32,

    /// TTL cap (0 disables)
    pub max_ttl: u32,

    /// TTL for negative and empty answers
    pub negative_ttl: u32,

    /// Keep source TTLs below `min_ttl` instead of raising them
    pub respect_source_ttl: bool,

    /// Serve entries past soft expiry while a refresh runs
    pub serve_stale: bool,

    /// How far past soft expiry an entry stays servable
    pub stale_ttl: Duration,

    /// TTL stamped on stale replies (at least 1 s)
    pub expired_entry_ttl: u32,

    /// Remaining-TTL threshold for refreshing hot keys early
    pub hot_ttl: Duration,

    /// Effective hits within `hit_window` that make a key hot
    pub hot_threshold: u64,

    /// Window for the per-key hit counter
    pub hit_window: Duration,

    /// Probability of counting any given cache hit
    pub hit_count_sample_rate: f64,

    /// Distributed refresh lock TTL
    pub lock_ttl: Duration,

    /// Concurrent refresh task bound per instance
    pub max_inflight: usize,

    /// Sweeper cadence
    pub sweep_interval: Duration,

    /// How far ahead of soft expiry the sweeper pulls candidates
    pub sweep_window: Duration,

    /// Sweep-hit floor below which a key is deleted instead of refreshed
    pub sweep_min_hits: u64,

    /// Window for the sweep-hit counter
    pub sweep_hit_window: Duration,

    /// Candidate batch bound per sweep
    pub max_batch_size: usize,

    /// Sweeps between expiry-index reconciliation passes
    pub reconcile_interval: u64,

    /// Sweeps between deletion-candidate recounts
    pub deletion_candidates_interval: u64,

    /// L1 key cap enforced by the sweeper (0 disables)
    pub max_keys: usize,

    /// Per-key SERVFAIL backoff window
    pub servfail_backoff: Duration,

    /// Consecutive SERVFAILs after which refresh scheduling stops
    pub servfail_refresh_threshold: u32,

    /// Per-key SERVFAIL log rate limit
    pub servfail_log_interval: Duration,

    /// Global refresh-failure log rate limit
    pub refresh_fail_log_interval: Duration,

    /// Inline blocklist rules
    pub block_rules: Vec<String>,

    /// Blocklist files (one rule per line)
    pub blocklist_files: Vec<String>,

    /// Exact domains never blocked
    pub allowlist: Vec<String>,

    /// Exact domains always blocked
    pub denylist: Vec<String>,

    /// Reply shape for blocked queries
    pub blocked_response: BlockedResponse,

    /// TTL on blocked replies
    pub blocked_ttl: u32,

    /// Fire-and-forget webhook on block (None disables)
    pub block_webhook_url: Option<String>,

    /// Rewrite Google/Bing lookups to their enforced-safe-search hosts
    pub safe_search_enabled: bool,

    /// Local override records, `name:type:value[:ttl]`
    pub local_records: Vec<String>,

    /// Client map entries, `ip=name[@group]`
    pub clients: Vec<String>,

    /// Group policies, `group:key=value[,key=value]`
    pub groups: Vec<String>,

    /// Query event sampling rate in [0, 1]
    pub event_sample_rate: f64,

    /// Glob patterns of domains excluded from events
    pub event_exclude_domains: Vec<String>,

    /// Glob patterns of client names/IPs excluded from events
    pub event_exclude_clients: Vec<String>,

    /// Client IP anonymization applied to events
    pub event_anonymize: AnonymizeMode,

    /// Event sink buffer depth
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1053"
                .parse()
                .expect("default bind address is valid"),
            udp_listeners: 1,
            tcp_idle_timeout: Duration::from_secs(10),
            upstreams: vec![
                Upstream::parse("1.1.1.1:53").expect("Cloudflare DNS is valid"),
                Upstream::parse("8.8.8.8:53").expect("Google DNS is valid"),
            ],
            upstream_strategy: SelectionStrategy::Failover,
            upstream_timeout: Duration::from_secs(5),
            upstream_backoff: Duration::from_secs(30),
            probe_pooled_connections: false,
            l0_max_entries: 10_000,
            l0_shards: 32,
            redis_url: None,
            redis_cluster_mode: false,
            min_ttl: 30,
            max_ttl: 3600,
            negative_ttl: 300,
            respect_source_ttl: false,
            serve_stale: true,
            stale_ttl: Duration::from_secs(300),
            expired_entry_ttl: 30,
            hot_ttl: Duration::from_secs(300),
            hot_threshold: 10,
            hit_window: Duration::from_secs(60),
            hit_count_sample_rate: 1.0,
            lock_ttl: Duration::from_secs(30),
            max_inflight: 32,
            sweep_interval: Duration::from_secs(15),
            sweep_window: Duration::from_secs(60),
            sweep_min_hits: 2,
            sweep_hit_window: Duration::from_secs(72 * 3600),
            max_batch_size: 200,
            reconcile_interval: 240,
            deletion_candidates_interval: 20,
            max_keys: 0,
            servfail_backoff: Duration::from_secs(60),
            servfail_refresh_threshold: 10,
            servfail_log_interval: Duration::from_secs(60),
            refresh_fail_log_interval: Duration::from_secs(300),
            block_rules: Vec::new(),
            blocklist_files: Vec::new(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            blocked_response: BlockedResponse::NxDomain,
            blocked_ttl: 3600,
            block_webhook_url: None,
            safe_search_enabled: false,
            local_records: Vec::new(),
            clients: Vec::new(),
            groups: Vec::new(),
            event_sample_rate: 1.0,
            event_exclude_domains: Vec::new(),
            event_exclude_clients: Vec::new(),
            event_anonymize: AnonymizeMode::None,
            event_buffer: 4096,
        }
    }
}

impl Config {
    /// Build from environment variables, validating the result.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("WARDEN_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| WardenError::InvalidBindAddress(addr))?;
        }

        if let Some(n) = env_usize("WARDEN_UDP_LISTENERS")? {
            config.udp_listeners = n;
        }
        if let Some(secs) = env_u64("WARDEN_TCP_IDLE_TIMEOUT")? {
            config.tcp_idle_timeout = Duration::from_secs(secs);
        }

        if let Ok(list) = std::env::var("WARDEN_UPSTREAMS") {
            let upstreams: Result<Vec<Upstream>> = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Upstream::parse)
                .collect();
            let upstreams = upstreams?;
            if upstreams.is_empty() {
                return Err(WardenError::InvalidUpstream(
                    "no upstream servers configured".to_string(),
                ));
            }
            config.upstreams = upstreams;
        }

        if let Ok(strategy) = std::env::var("WARDEN_UPSTREAM_STRATEGY") {
            config.upstream_strategy = SelectionStrategy::parse(&strategy).ok_or_else(|| {
                WardenError::ConfigParseError(format!("invalid upstream strategy: {}", strategy))
            })?;
        }

        if let Some(secs) = env_u64("WARDEN_UPSTREAM_TIMEOUT")? {
            config.upstream_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("WARDEN_UPSTREAM_BACKOFF")? {
            config.upstream_backoff = Duration::from_secs(secs);
        }
        if let Some(v) = env_bool("WARDEN_PROBE_POOLED_CONNECTIONS") {
            config.probe_pooled_connections = v;
        }

        if let Some(n) = env_usize("WARDEN_L0_MAX_ENTRIES")? {
            config.l0_max_entries = n;
        }
        if let Some(n) = env_usize("WARDEN_L0_SHARDS")? {
            config.l0_shards = n;
        }

        if let Ok(url) = std::env::var("WARDEN_REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        } else if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }
        if let Some(v) = env_bool("WARDEN_REDIS_CLUSTER_MODE") {
            config.redis_cluster_mode = v;
        }

        if let Some(ttl) = env_u32("WARDEN_MIN_TTL")? {
            config.min_ttl = ttl;
        }
        if let Some(ttl) = env_u32("WARDEN_MAX_TTL")? {
            config.max_ttl = ttl;
        }
        if let Some(ttl) = env_u32("WARDEN_NEGATIVE_TTL")? {
            config.negative_ttl = ttl;
        }
        if let Some(v) = env_bool("WARDEN_RESPECT_SOURCE_TTL") {
            config.respect_source_ttl = v;
        }

        if let Some(v) = env_bool("WARDEN_SERVE_STALE") {
            config.serve_stale = v;
        }
        if let Some(secs) = env_u64("WARDEN_STALE_TTL")? {
            config.stale_ttl = Duration::from_secs(secs);
        }
        if let Some(ttl) = env_u32("WARDEN_EXPIRED_ENTRY_TTL")? {
            config.expired_entry_ttl = ttl;
        }

        if let Some(secs) = env_u64("WARDEN_HOT_TTL")? {
            config.hot_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("WARDEN_HOT_THRESHOLD")? {
            config.hot_threshold = n;
        }
        if let Some(secs) = env_u64("WARDEN_HIT_WINDOW")? {
            config.hit_window = Duration::from_secs(secs);
        }
        if let Some(rate) = env_f64("WARDEN_HIT_COUNT_SAMPLE_RATE")? {
            config.hit_count_sample_rate = rate;
        }
        if let Some(secs) = env_u64("WARDEN_LOCK_TTL")? {
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("WARDEN_MAX_INFLIGHT_REFRESHES")? {
            config.max_inflight = n;
        }

        if let Some(secs) = env_u64("WARDEN_SWEEP_INTERVAL")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("WARDEN_SWEEP_WINDOW")? {
            config.sweep_window = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("WARDEN_SWEEP_MIN_HITS")? {
            config.sweep_min_hits = n;
        }
        if let Some(secs) = env_u64("WARDEN_SWEEP_HIT_WINDOW")? {
            config.sweep_hit_window = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("WARDEN_SWEEP_MAX_BATCH")? {
            config.max_batch_size = n;
        }
        if let Some(n) = env_u64("WARDEN_RECONCILE_INTERVAL")? {
            config.reconcile_interval = n;
        }
        if let Some(n) = env_u64("WARDEN_DELETION_CANDIDATES_INTERVAL")? {
            config.deletion_candidates_interval = n;
        }
        if let Some(n) = env_usize("WARDEN_MAX_KEYS")? {
            config.max_keys = n;
        }

        if let Some(secs) = env_u64("WARDEN_SERVFAIL_BACKOFF")? {
            config.servfail_backoff = Duration::from_secs(secs);
        }
        if let Some(n) = env_u32("WARDEN_SERVFAIL_REFRESH_THRESHOLD")? {
            config.servfail_refresh_threshold = n;
        }
        if let Some(secs) = env_u64("WARDEN_SERVFAIL_LOG_INTERVAL")? {
            config.servfail_log_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("WARDEN_REFRESH_FAIL_LOG_INTERVAL")? {
            config.refresh_fail_log_interval = Duration::from_secs(secs);
        }

        if let Ok(rules) = std::env::var("WARDEN_BLOCKLIST") {
            config.block_rules = split_list(&rules);
        }
        if let Ok(files) = std::env::var("WARDEN_BLOCKLIST_FILES") {
            config.blocklist_files = split_list(&files);
        }
        if let Ok(list) = std::env::var("WARDEN_ALLOWLIST") {
            config.allowlist = split_list(&list);
        }
        if let Ok(list) = std::env::var("WARDEN_DENYLIST") {
            config.denylist = split_list(&list);
        }
        if let Ok(mode) = std::env::var("WARDEN_BLOCKED_RESPONSE") {
            config.blocked_response = BlockedResponse::parse(&mode).ok_or_else(|| {
                WardenError::ConfigParseError(format!("invalid blocked response: {}", mode))
            })?;
        }
        if let Some(ttl) = env_u32("WARDEN_BLOCKED_TTL")? {
            config.blocked_ttl = ttl;
        }
        if let Ok(url) = std::env::var("WARDEN_BLOCK_WEBHOOK_URL") {
            if !url.is_empty() {
                config.block_webhook_url = Some(url);
            }
        }

        if let Some(v) = env_bool("WARDEN_SAFE_SEARCH") {
            config.safe_search_enabled = v;
        }
        if let Ok(records) = std::env::var("WARDEN_LOCAL_RECORDS") {
            config.local_records = split_list(&records);
        }
        if let Ok(clients) = std::env::var("WARDEN_CLIENTS") {
            config.clients = split_list(&clients);
        }
        if let Ok(groups) = std::env::var("WARDEN_GROUPS") {
            config.groups = split_list(&groups);
        }

        if let Some(rate) = env_f64("WARDEN_EVENT_SAMPLE_RATE")? {
            config.event_sample_rate = rate;
        }
        if let Ok(list) = std::env::var("WARDEN_EVENT_EXCLUDE_DOMAINS") {
            config.event_exclude_domains = split_list(&list);
        }
        if let Ok(list) = std::env::var("WARDEN_EVENT_EXCLUDE_CLIENTS") {
            config.event_exclude_clients = split_list(&list);
        }
        if let Ok(mode) = std::env::var("WARDEN_EVENT_ANONYMIZE") {
            config.event_anonymize = AnonymizeMode::parse(&mode).ok_or_else(|| {
                WardenError::ConfigParseError(format!("invalid anonymize mode: {}", mode))
            })?;
        }
        if let Some(n) = env_usize("WARDEN_EVENT_BUFFER")? {
            config.event_buffer = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(WardenError::InvalidUpstream(
                "at least one upstream is required".to_string(),
            ));
        }
        if self.upstream_timeout.is_zero() || self.upstream_timeout > Duration::from_secs(300) {
            return Err(WardenError::InvalidTimeout(
                "upstream timeout must be in (0, 300] seconds".to_string(),
            ));
        }
        if self.l0_max_entries == 0 || self.l0_max_entries > 10_000_000 {
            return Err(WardenError::InvalidCacheSize(
                "L0 size must be in [1, 10 million] entries".to_string(),
            ));
        }
        if self.udp_listeners == 0 {
            return Err(WardenError::ConfigParseError(
                "at least one UDP listener is required".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hit_count_sample_rate) {
            return Err(WardenError::ConfigParseError(
                "hit count sample rate must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.event_sample_rate) {
            return Err(WardenError::ConfigParseError(
                "event sample rate must be in [0, 1]".to_string(),
            ));
        }
        if self.expired_entry_ttl == 0 {
            return Err(WardenError::ConfigParseError(
                "expired entry TTL must be at least 1 second".to_string(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(WardenError::ConfigParseError(
                "refresh lock TTL must be positive".to_string(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(WardenError::ConfigParseError(
                "max in-flight refreshes must be positive".to_string(),
            ));
        }
        if self.max_ttl > 0 && self.min_ttl > self.max_ttl {
            return Err(WardenError::ConfigParseError(
                "min TTL must not exceed max TTL".to_string(),
            ));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| parse_bool(&v, false))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| WardenError::ConfigParseError(format!("invalid {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| WardenError::ConfigParseError(format!("invalid {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| WardenError::ConfigParseError(format!("invalid {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_f64(name: &str) -> Result<Option<f64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| WardenError::ConfigParseError(format!("invalid {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Parse a boolean from a string, with a default for unrecognized input.
pub fn parse_bool(s: &str, default: bool) -> bool {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}
