//! Upstream selection, backoff, and per-protocol exchange.

pub mod doh;
pub mod pool;
pub mod tls;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dns::DnsMessage;
use crate::error::{Result, WardenError};
use doh::DohExchanger;
use pool::{TcpPool, UdpPool, is_retriable, read_prefixed, send_prefixed};
use tls::TlsExchanger;

const EWMA_ALPHA: f64 = 0.2;
const EWMA_INITIAL_MS: f64 = 50.0;
const EWMA_FLOOR_MS: f64 = 1.0;
const UDP_RESPONSE_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
}

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Udp => "udp",
            UpstreamProtocol::Tcp => "tcp",
            UpstreamProtocol::Tls => "tls",
            UpstreamProtocol::Https => "https",
            UpstreamProtocol::Quic => "quic",
        }
    }
}

/// One configured forwarder. Encrypted variants keep the scheme in the
/// address (`tls://host:port`, `https://host/dns-query`).
#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub address: String,
    pub protocol: UpstreamProtocol,
    socket_addr: Option<SocketAddr>,
    tls_host: Option<String>,
    url: Option<String>,
}

impl Upstream {
    /// Parse `[name=]address` where the address scheme picks the protocol;
    /// plain `ip:port` means UDP.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (name, address) = match spec.split_once('=') {
            Some((name, address)) if !name.contains('/') => {
                (name.trim().to_string(), address.trim().to_string())
            }
            _ => (spec.to_string(), spec.to_string()),
        };

        let invalid = || WardenError::InvalidUpstream(address.clone());

        if let Some(rest) = address.strip_prefix("udp://") {
            let socket_addr = resolve_host_port(rest, 53).ok_or_else(invalid)?;
            return Ok(Self::transport(name, address.clone(), UpstreamProtocol::Udp, socket_addr, None));
        }
        if let Some(rest) = address.strip_prefix("tcp://") {
            let socket_addr = resolve_host_port(rest, 53).ok_or_else(invalid)?;
            return Ok(Self::transport(name, address.clone(), UpstreamProtocol::Tcp, socket_addr, None));
        }
        if let Some(rest) = address.strip_prefix("tls://") {
            let host = rest.rsplit_once(':').map(|(h, _)| h).unwrap_or(rest);
            let socket_addr = resolve_host_port(rest, 853).ok_or_else(invalid)?;
            return Ok(Self::transport(
                name,
                address.clone(),
                UpstreamProtocol::Tls,
                socket_addr,
                Some(host.trim_matches(['[', ']']).to_string()),
            ));
        }
        if address.starts_with("https://") {
            return Ok(Self {
                name,
                url: Some(address.clone()),
                address,
                protocol: UpstreamProtocol::Https,
                socket_addr: None,
                tls_host: None,
            });
        }
        if address.starts_with("quic://") {
            return Ok(Self {
                name,
                address,
                protocol: UpstreamProtocol::Quic,
                socket_addr: None,
                tls_host: None,
                url: None,
            });
        }

        // Bare host:port defaults to UDP.
        let socket_addr = resolve_host_port(&address, 53).ok_or_else(invalid)?;
        Ok(Self::transport(name, address.clone(), UpstreamProtocol::Udp, socket_addr, None))
    }

    fn transport(
        name: String,
        address: String,
        protocol: UpstreamProtocol,
        socket_addr: SocketAddr,
        tls_host: Option<String>,
    ) -> Self {
        Self {
            name,
            address,
            protocol,
            socket_addr: Some(socket_addr),
            tls_host,
            url: None,
        }
    }
}

fn resolve_host_port(spec: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Some(addr);
    }
    let with_port = if spec.contains(':') && !spec.starts_with('[') {
        spec.to_string()
    } else {
        format!("{}:{}", spec, default_port)
    };
    with_port.to_socket_addrs().ok()?.next()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Failover,
    LoadBalance,
    Weighted,
}

impl SelectionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "failover" => Some(SelectionStrategy::Failover),
            "load_balance" => Some(SelectionStrategy::LoadBalance),
            "weighted" => Some(SelectionStrategy::Weighted),
            _ => None,
        }
    }
}

struct UpstreamState {
    upstream: Upstream,
    ewma_ms: Mutex<f64>,
    unavailable_until: Mutex<Option<Instant>>,
}

impl UpstreamState {
    fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            ewma_ms: Mutex::new(EWMA_INITIAL_MS),
            unavailable_until: Mutex::new(None),
        }
    }

    fn record_success(&self, rtt: Duration) {
        let mut ewma = self.ewma_ms.lock();
        let sample = (rtt.as_secs_f64() * 1000.0).max(EWMA_FLOOR_MS);
        *ewma = (*ewma * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA).max(EWMA_FLOOR_MS);
        *self.unavailable_until.lock() = None;
    }

    fn record_failure(&self, backoff: Duration) {
        *self.unavailable_until.lock() = Some(Instant::now() + backoff);
    }

    fn is_available(&self) -> bool {
        match *self.unavailable_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    fn ewma(&self) -> f64 {
        *self.ewma_ms.lock()
    }
}

/// `upstream_config()` payload.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamConfigSnapshot {
    pub strategy: SelectionStrategy,
    pub upstreams: Vec<UpstreamInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    pub name: String,
    pub address: String,
    pub protocol: UpstreamProtocol,
}

pub struct ExchangeOutcome {
    pub response: DnsMessage,
    pub upstream: String,
}

/// Owns the forwarder set, the selection strategy, per-upstream backoff, and
/// the transport clients.
pub struct UpstreamManager {
    states: RwLock<Arc<Vec<Arc<UpstreamState>>>>,
    strategy: RwLock<SelectionStrategy>,
    rr_counter: AtomicUsize,
    timeout: Duration,
    backoff: Duration,
    udp_pool: UdpPool,
    tcp_pool: TcpPool,
    tls: TlsExchanger,
    doh: DohExchanger,
}

impl UpstreamManager {
    pub fn new(
        upstreams: Vec<Upstream>,
        strategy: SelectionStrategy,
        timeout: Duration,
        backoff: Duration,
        probe_pooled_connections: bool,
    ) -> Result<Self> {
        let states = upstreams
            .into_iter()
            .map(|u| Arc::new(UpstreamState::new(u)))
            .collect::<Vec<_>>();

        Ok(Self {
            states: RwLock::new(Arc::new(states)),
            strategy: RwLock::new(strategy),
            rr_counter: AtomicUsize::new(0),
            timeout,
            backoff,
            udp_pool: UdpPool::new(),
            tcp_pool: TcpPool::new(probe_pooled_connections, Duration::from_secs(2)),
            tls: TlsExchanger::new(),
            doh: DohExchanger::new(timeout)?,
        })
    }

    /// Swap in a new forwarder set; EWMA and backoff state start fresh.
    pub fn apply_upstreams(&self, upstreams: Vec<Upstream>, strategy: SelectionStrategy) {
        let states = upstreams
            .into_iter()
            .map(|u| Arc::new(UpstreamState::new(u)))
            .collect::<Vec<_>>();
        *self.states.write() = Arc::new(states);
        *self.strategy.write() = strategy;
    }

    pub fn upstream_config(&self) -> UpstreamConfigSnapshot {
        let states = self.states.read().clone();
        UpstreamConfigSnapshot {
            strategy: *self.strategy.read(),
            upstreams: states
                .iter()
                .map(|s| UpstreamInfo {
                    name: s.upstream.name.clone(),
                    address: s.upstream.address.clone(),
                    protocol: s.upstream.protocol,
                })
                .collect(),
        }
    }

    /// Try upstreams in strategy order. Transport failures back the
    /// upstream off and move on; a SERVFAIL response is returned as-is
    /// without trying the rest.
    pub async fn exchange(&self, query: &DnsMessage) -> Result<ExchangeOutcome> {
        let bytes = query
            .to_bytes()
            .map_err(|e| WardenError::InvalidRequest(e.to_string()))?;
        let order = self.pick_order();
        let mut last_err = None;

        for state in order {
            if !state.is_available() {
                debug!("Skipping {} (backing off)", state.upstream.address);
                continue;
            }

            let started = Instant::now();
            match self.exchange_one(&state, &bytes, query.header.id).await {
                Ok(response) => {
                    state.record_success(started.elapsed());
                    return Ok(ExchangeOutcome {
                        response,
                        upstream: state.upstream.address.clone(),
                    });
                }
                Err(err) => {
                    warn!(
                        "Upstream {} failed, backing off {:?}: {}",
                        state.upstream.address, self.backoff, err
                    );
                    state.record_failure(self.backoff);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(WardenError::NoUpstreamAvailable))
    }

    fn pick_order(&self) -> Vec<Arc<UpstreamState>> {
        let states = self.states.read().clone();
        let strategy = *self.strategy.read();
        let mut order: Vec<Arc<UpstreamState>> = states.iter().cloned().collect();
        if order.is_empty() {
            return order;
        }

        match strategy {
            SelectionStrategy::Failover => {}
            SelectionStrategy::LoadBalance => {
                let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % order.len();
                order.rotate_left(start);
            }
            SelectionStrategy::Weighted => {
                order.sort_by(|a, b| {
                    a.ewma()
                        .partial_cmp(&b.ewma())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }
        order
    }

    async fn exchange_one(
        &self,
        state: &UpstreamState,
        query: &[u8],
        query_id: u16,
    ) -> Result<DnsMessage> {
        let upstream = &state.upstream;
        match upstream.protocol {
            UpstreamProtocol::Udp => {
                let server = self.require_addr(upstream)?;
                let response = self.exchange_udp(server, query, query_id).await?;
                if response.header.tc {
                    // Truncated: retry over TCP against the same upstream.
                    debug!("Truncated UDP answer from {}, retrying over TCP", server);
                    return self.exchange_tcp(server, query).await.map_err(|err| {
                        match err {
                            WardenError::UpstreamTransport { upstream, message } => {
                                WardenError::TruncationFallback { upstream, message }
                            }
                            other => other,
                        }
                    });
                }
                Ok(response)
            }
            UpstreamProtocol::Tcp => {
                let server = self.require_addr(upstream)?;
                self.exchange_tcp(server, query).await
            }
            UpstreamProtocol::Tls => {
                let server = self.require_addr(upstream)?;
                let host = upstream
                    .tls_host
                    .as_deref()
                    .unwrap_or(&upstream.address);
                let bytes = self
                    .tls
                    .exchange(server, host, query, self.timeout)
                    .await
                    .map_err(|e| WardenError::UpstreamTransport {
                        upstream: upstream.address.clone(),
                        message: e.to_string(),
                    })?;
                parse_response(&bytes, &upstream.address)
            }
            UpstreamProtocol::Https => {
                let url = upstream.url.as_deref().unwrap_or(&upstream.address);
                let bytes = self.doh.exchange(url, query).await?;
                parse_response(&bytes, &upstream.address)
            }
            UpstreamProtocol::Quic => Err(WardenError::UpstreamTransport {
                upstream: upstream.address.clone(),
                message: "DNS-over-QUIC exchange is not implemented".to_string(),
            }),
        }
    }

    fn require_addr(&self, upstream: &Upstream) -> Result<SocketAddr> {
        upstream
            .socket_addr
            .ok_or_else(|| WardenError::InvalidUpstream(upstream.address.clone()))
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        query: &[u8],
        query_id: u16,
    ) -> Result<DnsMessage> {
        let transport_err = |message: String| WardenError::UpstreamTransport {
            upstream: server.to_string(),
            message,
        };

        let socket = self
            .udp_pool
            .get(server)
            .await
            .map_err(|e| transport_err(e.to_string()))?;

        let result = tokio::time::timeout(self.timeout, async {
            socket.send(query).await?;
            let mut buf = vec![0u8; UDP_RESPONSE_BUF];
            loop {
                let len = socket.recv(&mut buf).await?;
                // Ignore stray datagrams whose id does not match.
                if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == query_id {
                    return std::io::Result::Ok(buf[..len].to_vec());
                }
            }
        })
        .await;

        match result {
            Ok(Ok(bytes)) => {
                self.udp_pool.put(server, socket).await;
                parse_response(&bytes, &server.to_string())
            }
            Ok(Err(err)) => Err(transport_err(err.to_string())),
            Err(_) => Err(transport_err("timeout".to_string())),
        }
    }

    async fn exchange_tcp(&self, server: SocketAddr, query: &[u8]) -> Result<DnsMessage> {
        let transport_err = |message: String| WardenError::UpstreamTransport {
            upstream: server.to_string(),
            message,
        };

        let (mut stream, reused) = self
            .tcp_pool
            .get(server)
            .await
            .map_err(|e| transport_err(e.to_string()))?;

        match self.tcp_round_trip(&mut stream, query).await {
            Ok(bytes) => {
                self.tcp_pool.put(server, stream).await;
                return parse_response(&bytes, &server.to_string());
            }
            Err(err) if reused && is_retriable(&err) => {
                // The pooled connection died under us; one shot on a fresh one.
                debug!("Reused connection to {} failed ({}), retrying", server, err);
            }
            Err(err) => return Err(transport_err(err.to_string())),
        }

        let mut stream =
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(server))
                .await
                .map_err(|_| transport_err("connect timeout".to_string()))?
                .map_err(|e| transport_err(e.to_string()))?;
        let bytes = self
            .tcp_round_trip(&mut stream, query)
            .await
            .map_err(|e| transport_err(e.to_string()))?;
        self.tcp_pool.put(server, stream).await;
        parse_response(&bytes, &server.to_string())
    }

    async fn tcp_round_trip(
        &self,
        stream: &mut tokio::net::TcpStream,
        query: &[u8],
    ) -> std::io::Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, async {
            send_prefixed(stream, query).await?;
            read_prefixed(stream).await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "exchange timeout"))?
    }

    /// Drop pooled connections at shutdown.
    pub async fn drain(&self) {
        self.tcp_pool.drain().await;
        self.tls.drain();
    }
}

fn parse_response(bytes: &[u8], upstream: &str) -> Result<DnsMessage> {
    DnsMessage::parse(bytes).map_err(|e| WardenError::UpstreamTransport {
        upstream: upstream.to_string(),
        message: format!("undecodable response: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_address_is_udp() {
        let upstream = Upstream::parse("1.1.1.1:53").unwrap();
        assert_eq!(upstream.protocol, UpstreamProtocol::Udp);
        assert_eq!(upstream.socket_addr, Some("1.1.1.1:53".parse().unwrap()));
        assert_eq!(upstream.name, "1.1.1.1:53");
    }

    #[test]
    fn parse_named_tls_upstream() {
        let upstream = Upstream::parse("cloudflare=tls://1.1.1.1:853").unwrap();
        assert_eq!(upstream.name, "cloudflare");
        assert_eq!(upstream.protocol, UpstreamProtocol::Tls);
        assert_eq!(upstream.tls_host.as_deref(), Some("1.1.1.1"));
        assert_eq!(upstream.socket_addr, Some("1.1.1.1:853".parse().unwrap()));
    }

    #[test]
    fn parse_doh_upstream() {
        let upstream = Upstream::parse("https://dns.example/dns-query").unwrap();
        assert_eq!(upstream.protocol, UpstreamProtocol::Https);
        assert_eq!(upstream.url.as_deref(), Some("https://dns.example/dns-query"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Upstream::parse("not an address").is_err());
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            SelectionStrategy::parse("weighted"),
            Some(SelectionStrategy::Weighted)
        );
        assert_eq!(
            SelectionStrategy::parse("load_balance"),
            Some(SelectionStrategy::LoadBalance)
        );
        assert_eq!(SelectionStrategy::parse("bogus"), None);
    }

    #[test]
    fn ewma_moves_toward_samples() {
        let state = UpstreamState::new(Upstream::parse("1.1.1.1:53").unwrap());
        assert!((state.ewma() - EWMA_INITIAL_MS).abs() < f64::EPSILON);
        state.record_success(Duration::from_millis(10));
        let after = state.ewma();
        assert!(after < EWMA_INITIAL_MS && after > 10.0);

        // Floor at 1 ms.
        for _ in 0..100 {
            state.record_success(Duration::from_micros(10));
        }
        assert!(state.ewma() >= EWMA_FLOOR_MS);
    }

    #[test]
    fn backoff_marks_unavailable() {
        let state = UpstreamState::new(Upstream::parse("1.1.1.1:53").unwrap());
        assert!(state.is_available());
        state.record_failure(Duration::from_secs(30));
        assert!(!state.is_available());
        state.record_success(Duration::from_millis(5));
        assert!(state.is_available());
    }
}
