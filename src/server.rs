//! UDP and TCP listeners. Every packet/connection is handed to its own
//! task; the listener loops only receive and dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dns::DnsMessage;
use crate::error::{Result, WardenError};
use crate::resolver::{RequestContext, Resolver};

const UDP_BUF_SIZE: usize = 4096;
const TCP_MAX_MESSAGE: usize = 65_535;

pub struct Server {
    resolver: Arc<Resolver>,
    bind_addr: SocketAddr,
    udp_listeners: usize,
    tcp_idle_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(
        resolver: Arc<Resolver>,
        bind_addr: SocketAddr,
        udp_listeners: usize,
        tcp_idle_timeout: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            resolver,
            bind_addr,
            udp_listeners: udp_listeners.max(1),
            tcp_idle_timeout,
            shutdown_tx,
        }
    }

    /// Bind both listeners and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let udp = Arc::new(UdpSocket::bind(self.bind_addr).await.map_err(|e| {
            WardenError::Io(format!("failed to bind UDP {}: {}", self.bind_addr, e))
        })?);
        let tcp = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            WardenError::Io(format!("failed to bind TCP {}: {}", self.bind_addr, e))
        })?;
        info!(
            "Listening on {} (udp x{}, tcp)",
            self.bind_addr, self.udp_listeners
        );

        let mut tasks = Vec::new();

        for n in 0..self.udp_listeners {
            let socket = Arc::clone(&udp);
            let resolver = Arc::clone(&self.resolver);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = udp_loop(socket, resolver) => {}
                    _ = shutdown.recv() => {
                        debug!("UDP listener {} stopped", n);
                    }
                }
            }));
        }

        {
            let resolver = Arc::clone(&self.resolver);
            let idle = self.tcp_idle_timeout;
            let shutdown_tx = self.shutdown_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tcp_loop(tcp, resolver, idle, shutdown_tx) => {}
                    _ = shutdown.recv() => {
                        debug!("TCP listener stopped");
                    }
                }
            }));
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!("Listener task panicked: {}", err);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn udp_loop(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, client)) => {
                let started = Instant::now();
                let wire = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move {
                    handle_udp(socket, resolver, wire, client, started).await;
                });
            }
            Err(err) => {
                warn!("UDP receive error: {}", err);
            }
        }
    }
}

async fn handle_udp(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    wire: Vec<u8>,
    client: SocketAddr,
    started: Instant,
) {
    let ctx = RequestContext {
        client,
        protocol: "udp",
    };
    let resolution = resolver.resolve(&wire, &ctx).await;

    // Replies larger than the client's advertised payload size go out
    // truncated; the client retries over TCP.
    let payload = if resolution.bytes.len() > resolution.udp_payload_limit {
        match DnsMessage::parse(&resolution.bytes) {
            Ok(full) => full.truncate_for_udp().to_bytes().unwrap_or_default(),
            Err(_) => resolution.bytes.clone(),
        }
    } else {
        resolution.bytes.clone()
    };

    let write_started = Instant::now();
    if let Err(err) = socket.send_to(&payload, client).await {
        // Terminal for this request; nothing to retry.
        warn!("Failed to write UDP response to {}: {}", client, err);
        return;
    }
    let network_write = write_started.elapsed();
    // The user-visible duration closes here; everything in finish() runs
    // after the fact.
    let duration = started.elapsed();

    resolver.finish(resolution, &ctx, duration, network_write);
}

async fn tcp_loop(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    idle: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, client)) => {
                let resolver = Arc::clone(&resolver);
                let mut shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = handle_tcp(stream, resolver, client, idle) => {}
                        _ = shutdown.recv() => {}
                    }
                });
            }
            Err(err) => {
                warn!("TCP accept error: {}", err);
            }
        }
    }
}

async fn handle_tcp(
    mut stream: TcpStream,
    resolver: Arc<Resolver>,
    client: SocketAddr,
    idle: Duration,
) {
    let ctx = RequestContext {
        client,
        protocol: "tcp",
    };

    // A client connection may carry multiple length-prefixed queries.
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(idle, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return,
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > TCP_MAX_MESSAGE {
            return;
        }
        let started = Instant::now();

        let mut wire = vec![0u8; len];
        match tokio::time::timeout(idle, stream.read_exact(&mut wire)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return,
        }

        let resolution = resolver.resolve(&wire, &ctx).await;

        let write_started = Instant::now();
        let response_len = resolution.bytes.len().min(TCP_MAX_MESSAGE) as u16;
        let write = async {
            stream.write_all(&response_len.to_be_bytes()).await?;
            stream.write_all(&resolution.bytes[..response_len as usize]).await?;
            stream.flush().await
        };
        if let Err(err) = write.await {
            warn!("Failed to write TCP response to {}: {}", client, err);
            return;
        }
        let network_write = write_started.elapsed();
        let duration = started.elapsed();

        resolver.finish(resolution, &ctx, duration, network_write);
    }
}
