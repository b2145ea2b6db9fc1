//! rsocket-cli - Command-line client for rsocket servers
//!
//! Connects over TCP, runs one interaction and prints the result.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rsocket_core::{ConnectionConfig, RSocketConnector, SetupConfig};
use rsocket_transport::tcp;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rsocket-cli")]
#[command(about = "Command-line client for rsocket servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7878", env = "RSOCKET_SERVER")]
    server: SocketAddr,

    /// Keepalive interval in milliseconds
    #[arg(long, default_value = "20000")]
    keepalive_ms: u64,

    /// Max lifetime without inbound frames in milliseconds
    #[arg(long, default_value = "90000")]
    lifetime_ms: u64,

    /// Data MIME type announced in SETUP
    #[arg(long, default_value = "application/binary")]
    data_mime_type: String,

    /// Metadata MIME type announced in SETUP
    #[arg(long, default_value = "application/binary")]
    metadata_mime_type: String,

    /// Split outbound payloads above this size (0 = never)
    #[arg(long, default_value = "0")]
    fragment_size: usize,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "10000")]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Send a fire-and-forget request
    Fnf {
        /// Request data
        data: String,

        /// Request metadata
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Send a request-response and print the answer
    Request {
        /// Request data
        data: String,

        /// Request metadata
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Open a request-stream and print every item
    Stream {
        /// Request data
        data: String,

        /// Request metadata
        #[arg(short, long)]
        metadata: Option<String>,

        /// Items requested per batch
        #[arg(short = 'n', long, default_value = "16")]
        request_n: u32,

        /// Stop after this many items
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Open a request-channel, send every item and print the responses
    Channel {
        /// Items to send; the first opens the channel
        #[arg(required = true)]
        items: Vec<String>,

        /// Items requested per batch
        #[arg(short = 'n', long, default_value = "16")]
        request_n: u32,
    },

    /// Push connection-level metadata
    MetadataPush {
        /// Metadata to push
        metadata: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let setup = SetupConfig::new()
        .with_keepalive(
            Duration::from_millis(cli.keepalive_ms),
            Duration::from_millis(cli.lifetime_ms),
        )
        .with_data_mime_type(cli.data_mime_type)
        .with_metadata_mime_type(cli.metadata_mime_type);
    let config = ConnectionConfig::new().with_fragment_size(cli.fragment_size);

    let transport = tcp::connect(cli.server, Duration::from_millis(cli.connect_timeout_ms))
        .await
        .map_err(|e| {
            eprintln!("{}: {}", "Connection failed".red(), e);
            e
        })?;
    let socket = RSocketConnector::new()
        .with_setup(setup)
        .with_config(config)
        .connect(transport)
        .await?;
    tracing::debug!("connected to {}", cli.server);

    match commands::execute(&socket, cli.command).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            socket.close().await;
            std::process::exit(1);
        }
    }

    socket.close().await;
    Ok(())
}
