//! Transport error types.

use rsocket_core::RSocketError;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("rsocket error: {0}")]
    RSocket(#[from] RSocketError),
}
