//! rsocket-echo - RSocket echo server
//!
//! Serves the echo responder over TCP to every client that completes the
//! setup handshake.

mod echo;

use echo::EchoResponder;
use rsocket_core::{RSocket, RSocketError, Responder, SetupPayload, SocketAcceptor};
use rsocket_transport::{Config, TcpServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RSOCKET_CONFIG is set, then env overrides)
    let config_path = std::env::var("RSOCKET_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicit config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting rsocket echo server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    if config.protocol.fragment_size == 0 {
        tracing::info!("  Fragmentation: disabled");
    } else {
        tracing::info!("  Fragmentation: {} bytes", config.protocol.fragment_size);
    }
    tracing::info!("  Setup timeout: {}ms", config.protocol.setup_timeout_ms);

    let acceptor: Arc<dyn SocketAcceptor> = Arc::new(
        |setup: &SetupPayload, _: RSocket| -> Result<Arc<dyn Responder>, RSocketError> {
            tracing::debug!(
                "accepting {} / {} client",
                setup.data_mime_type,
                setup.metadata_mime_type
            );
            Ok(Arc::new(EchoResponder))
        },
    );
    let server = Arc::new(TcpServer::bind(config.server_config(), acceptor).await?);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
