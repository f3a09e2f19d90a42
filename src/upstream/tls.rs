//! DNS-over-TLS client (RFC 7858).
//!
//! A single shared rustls `ClientConfig` is built once; idle TLS streams are
//! pooled per (address, hostname) so reuse skips the handshake. A stale
//! pooled stream falls through to one fresh connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::pool::{is_retriable, read_prefixed, send_prefixed};

const MAX_IDLE_PER_HOST: usize = 2;

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

type PoolKey = (SocketAddr, String);

pub struct TlsExchanger {
    pool: DashMap<PoolKey, Vec<TlsStream<TcpStream>>>,
}

impl TlsExchanger {
    pub fn new() -> Self {
        Self {
            pool: DashMap::new(),
        }
    }

    pub async fn exchange(
        &self,
        server: SocketAddr,
        hostname: &str,
        query: &[u8],
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        if let Some(mut stream) = self.take_pooled(server, hostname) {
            match Self::send_on(&mut stream, query, timeout).await {
                Ok(response) => {
                    self.return_pooled(server, hostname, stream);
                    return Ok(response);
                }
                Err(err) if is_retriable(&err) => {
                    debug!("Pooled TLS stream to {} stale, reconnecting", server);
                }
                Err(err) => return Err(err),
            }
        }

        let mut stream = self.connect(server, hostname, timeout).await?;
        let response = Self::send_on(&mut stream, query, timeout).await?;
        self.return_pooled(server, hostname, stream);
        Ok(response)
    }

    async fn connect(
        &self,
        server: SocketAddr,
        hostname: &str,
        timeout: Duration,
    ) -> io::Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(SHARED_TLS_CONFIG.clone());
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(server))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        tcp.set_nodelay(true)?;

        let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))??;

        debug!(server = %server, hostname, "TLS connection established");
        Ok(stream)
    }

    async fn send_on(
        stream: &mut TlsStream<TcpStream>,
        query: &[u8],
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        tokio::time::timeout(timeout, send_prefixed(stream, query))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS write timeout"))??;
        tokio::time::timeout(timeout, read_prefixed(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS read timeout"))?
    }

    fn take_pooled(&self, server: SocketAddr, hostname: &str) -> Option<TlsStream<TcpStream>> {
        self.pool
            .get_mut(&(server, hostname.to_string()))?
            .pop()
    }

    fn return_pooled(&self, server: SocketAddr, hostname: &str, stream: TlsStream<TcpStream>) {
        let mut idle = self.pool.entry((server, hostname.to_string())).or_default();
        if idle.len() < MAX_IDLE_PER_HOST {
            idle.push(stream);
        }
    }

    pub fn drain(&self) {
        self.pool.clear();
    }
}
