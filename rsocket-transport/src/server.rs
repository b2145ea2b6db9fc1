//! TCP server implementation.

use crate::config::Config;
use crate::error::TransportError;
use crate::tcp;
use rsocket_core::{ConnectionConfig, SocketAcceptor};
use rsocket_protocol::FrameCodec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Engine settings for accepted connections.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Config::default().server_config()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

impl Config {
    /// Builds the runtime server config from the loaded file/env config.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            max_connections: self.network.max_connections,
            connection: self.protocol.connection_config(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub setup_failures: AtomicU64,
}

/// TCP server that runs the RSocket setup handshake on every connection and
/// serves it with the responder chosen by the acceptor.
pub struct TcpServer {
    config: ServerConfig,
    listener: TcpListener,
    acceptor: Arc<dyn SocketAcceptor>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl TcpServer {
    /// Binds the listener. Port 0 picks a free port; see [`TcpServer::local_addr`].
    pub async fn bind(
        config: ServerConfig,
        acceptor: Arc<dyn SocketAcceptor>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            listener,
            acceptor,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until [`TcpServer::shutdown`] is called. Live
    /// connections are closed with ERROR(CONNECTION_CLOSE) on shutdown.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let acceptor = self.acceptor.clone();
                            let stats = self.stats.clone();
                            let connection = self.config.connection.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    acceptor,
                                    &connection,
                                    conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.setup_failures.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
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

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        acceptor: Arc<dyn SocketAcceptor>,
        connection: &ConnectionConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        tracing::info!("Client connected: {}", addr);
        let transport = tcp::wrap(stream, FrameCodec::new());
        let socket = rsocket_core::accept(transport, acceptor, connection).await?;

        tokio::select! {
            reason = socket.closed() => {
                tracing::debug!("[{}] connection ended: {}", addr, reason);
            }
            _ = shutdown.recv() => {
                tracing::debug!("[{}] closing for shutdown", addr);
                socket.close().await;
            }
        }
        Ok(())
    }

    /// Signals the accept loop and every live connection to stop.
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

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
