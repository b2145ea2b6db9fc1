//! # rsocket-core
//!
//! RSocket protocol engine.
//!
//! This crate provides:
//! - The four interaction models (fire-and-forget, request-response,
//!   request-stream, request-channel) plus metadata push
//! - Stream multiplexing over one transport with per-stream state machines
//! - Request-n flow control with pull-based producers
//! - Keepalive, leasing, fragmentation and the setup handshake
//! - An in-process transport for tests and embedding
//!
//! Each connection runs as a tokio task that owns all stream state; the
//! [`RSocket`] handle and [`PayloadStream`]s talk to it over a channel.

pub mod client;
pub mod config;
pub mod error;
pub mod flow;
pub mod lease;
mod multiplexer;
pub mod registry;
pub mod responder;
pub mod resume;
pub mod server;
mod socket;
mod stream;
pub mod transport;

pub use client::RSocketConnector;
pub use config::{ConnectionConfig, SetupConfig};
pub use error::RSocketError;
pub use responder::{
    EmptyResponder, PayloadFlux, Responder, ResponseFuture, SetupPayload, SocketAcceptor,
};
pub use server::accept;
pub use socket::{PayloadStream, RSocket};
pub use stream::{Interaction, Role, StreamEvent, StreamState};
pub use transport::{FrameSink, FrameStream, Transport};

pub use rsocket_protocol::{ErrorCode, Payload};
