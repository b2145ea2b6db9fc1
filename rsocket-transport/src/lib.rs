//! # rsocket-transport
//!
//! TCP transport for rsocket.
//!
//! This crate provides:
//! - TCP client connections wrapped in the length-prefixed frame codec
//! - A TCP server accept loop with a connection limit and graceful shutdown
//! - Server configuration from YAML files and environment variables

pub mod config;
pub mod error;
pub mod server;
pub mod tcp;

pub use config::{Config, ConfigError, NetworkConfig, ProtocolConfig};
pub use error::TransportError;
pub use server::{ServerConfig, ServerStats, TcpServer};
pub use tcp::{connect, DEFAULT_CONNECT_TIMEOUT};
