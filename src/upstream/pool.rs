//! Shared UDP sockets and pooled TCP connections for upstream exchanges.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

const MAX_IDLE_PER_SERVER: usize = 4;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Two-byte length prefix framing used by DNS over TCP and TLS.
pub(crate) async fn send_prefixed<S>(stream: &mut S, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub(crate) async fn read_prefixed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Errors worth one fresh-connection retry when they hit a reused stream.
pub(crate) fn is_retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}

/// Pool of connected UDP sockets, one set per upstream address.
pub struct UdpPool {
    sockets: Mutex<HashMap<SocketAddr, Vec<UdpSocket>>>,
}

impl UdpPool {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, server: SocketAddr) -> io::Result<UdpSocket> {
        {
            let mut pool = self.sockets.lock().await;
            if let Some(sockets) = pool.get_mut(&server) {
                if let Some(socket) = sockets.pop() {
                    return Ok(socket);
                }
            }
        }

        let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        debug!("New upstream UDP socket for {}", server);
        Ok(socket)
    }

    pub async fn put(&self, server: SocketAddr, socket: UdpSocket) {
        let mut pool = self.sockets.lock().await;
        let sockets = pool.entry(server).or_default();
        if sockets.len() < MAX_IDLE_PER_SERVER {
            sockets.push(socket);
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

/// Pool of idle TCP connections with timed eviction and an optional pre-use
/// liveness probe.
pub struct TcpPool {
    idle: Mutex<HashMap<SocketAddr, Vec<IdleConn>>>,
    probe_before_use: bool,
    connect_timeout: Duration,
}

impl TcpPool {
    pub fn new(probe_before_use: bool, connect_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            probe_before_use,
            connect_timeout,
        }
    }

    /// A pooled connection, plus whether it was reused (candidates for the
    /// one-shot retry).
    pub async fn get(&self, server: SocketAddr) -> io::Result<(TcpStream, bool)> {
        {
            let mut pool = self.idle.lock().await;
            if let Some(conns) = pool.get_mut(&server) {
                while let Some(conn) = conns.pop() {
                    if conn.since.elapsed() > IDLE_TIMEOUT {
                        continue;
                    }
                    if self.probe_before_use && !is_live(&conn.stream) {
                        debug!("Discarding dead pooled connection to {}", server);
                        continue;
                    }
                    return Ok((conn.stream, true));
                }
            }
        }

        let stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(server))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true)?;
        Ok((stream, false))
    }

    pub async fn put(&self, server: SocketAddr, stream: TcpStream) {
        let mut pool = self.idle.lock().await;
        let conns = pool.entry(server).or_default();
        if conns.len() < MAX_IDLE_PER_SERVER {
            conns.push(IdleConn {
                stream,
                since: Instant::now(),
            });
        }
    }

    pub async fn drain(&self) {
        self.idle.lock().await.clear();
    }
}

/// Non-blocking check that the peer has not closed or poisoned the stream.
fn is_live(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(_) => false, // EOF or unsolicited data; either way unusable
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}
