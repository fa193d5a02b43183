//! TCP server implementation.
//!
//! Socket tasks only move bytes between the network and each peer's
//! [`PeerHandle`]; all protocol work happens in the scheduler task that
//! drives [`Broker::run_once`].

use crate::broker::Broker;
use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::transport::PeerHandle;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often socket tasks flush queued output.
    pub flush_interval: Duration,
    /// How often the scheduler runs a pass.
    pub tick_interval: Duration,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("flush_interval", &self.flush_interval)
            .field("tick_interval", &self.tick_interval)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            flush_interval: config.network.flush_interval(),
            tick_interval: config.broker.tick_interval(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for stompd.
pub struct Server {
    config: ServerConfig,
    broker: Arc<Mutex<Broker>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server around a broker.
    pub fn new(config: ServerConfig, broker: Broker) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let broker = match config.metrics {
            Some(ref metrics) => broker.with_telemetry(metrics.clone()),
            None => broker,
        };
        Self {
            config,
            broker: Arc::new(Mutex::new(broker)),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop and scheduler on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let scheduler = tokio::spawn(run_scheduler(
            self.broker.clone(),
            self.config.tick_interval,
            self.shutdown.subscribe(),
        ));
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        if let Err(e) = scheduler.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.config.metrics {
                metrics.connections_rejected.inc();
            }
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let (peer, handle) = self.broker.lock().connect(addr, Instant::now());
        let broker = self.broker.clone();
        let stats = self.stats.clone();
        let metrics = self.config.metrics.clone();
        let flush_interval = self.config.flush_interval;
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result =
                handle_connection(tcp_stream, addr, handle, flush_interval, &mut conn_shutdown)
                    .await;
            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            broker.lock().disconnect(peer);
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = metrics {
                metrics.connections_active.dec();
            }
        });
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn broker(&self) -> &Arc<Mutex<Broker>> {
        &self.broker
    }
}

/// Drives the broker until shutdown.
async fn run_scheduler(
    broker: Arc<Mutex<Broker>>,
    tick_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                broker.lock().run_once(Instant::now());
            }
            _ = shutdown.recv() => {
                broker.lock().shutdown();
                break;
            }
        }
    }
}

/// Pumps bytes between a socket and its peer handle.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handle: Arc<PeerHandle>,
    flush_interval: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let mut buf = [0u8; 8192];
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result? {
                    0 => {
                        tracing::debug!("[{}] Connection closed by client", addr);
                        return Ok(());
                    }
                    n => handle.receive(&buf[..n]),
                }
            }
            _ = flush.tick() => {
                // Read the flag first so a final ERROR or RECEIPT is written.
                let closing = handle.is_disconnect_requested();
                let out = handle.transmit();
                if !out.is_empty() {
                    stream.write_all(&out).await?;
                }
                if closing {
                    tracing::debug!("[{}] Closing on broker request", addr);
                    break;
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }

    let out = handle.transmit();
    if !out.is_empty() {
        stream.write_all(&out).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stompd_protocol::{Command, Frame, StreamParser};
    use tokio::time::timeout;

    fn test_server() -> Server {
        let config = Config::default();
        Server::new(ServerConfig::from_config(&config), Broker::new(&config))
    }

    async fn start() -> (Arc<Server>, SocketAddr, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let server = Arc::new(test_server());
        // Use a random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        (server, addr, task)
    }

    async fn read_frame(client: &mut TcpStream, parser: &mut StreamParser) -> Option<Frame> {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(result) = parser.next_frame() {
                    return Some(result.unwrap());
                }
                let mut buf = [0u8; 1024];
                let n = client.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                parser.extend(&buf[..n]);
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server();
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        let (server, addr, task) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT\nlogin:guest\npasscode:guest\n\n\0")
            .await
            .unwrap();

        let mut parser = StreamParser::new();
        let frame = read_frame(&mut client, &mut parser).await.unwrap();
        assert_eq!(frame.kind(), Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
        assert!(server.is_running());

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_disconnect_closes_after_receipt() {
        let (server, addr, task) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT\nlogin:guest\npasscode:guest\n\n\0DISCONNECT\nreceipt:bye\n\n\0")
            .await
            .unwrap();

        let mut parser = StreamParser::new();
        let connected = read_frame(&mut client, &mut parser).await.unwrap();
        assert_eq!(connected.kind(), Command::Connected);
        let receipt = read_frame(&mut client, &mut parser).await.unwrap();
        assert_eq!(receipt.kind(), Command::Receipt);
        assert_eq!(receipt.header("receipt-id"), Some("bye"));
        assert!(read_frame(&mut client, &mut parser).await.is_none());

        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
