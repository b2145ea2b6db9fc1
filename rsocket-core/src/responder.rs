//! Application-facing handler traits.

use crate::error::RSocketError;
use crate::socket::{PayloadStream, RSocket};
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use rsocket_protocol::Payload;
use std::sync::Arc;
use std::time::Duration;

/// Outbound items produced by a stream or channel handler.
pub type PayloadFlux = BoxStream<'static, Result<Payload, RSocketError>>;

/// Answer to a request-response; `None` completes without a value.
pub type ResponseFuture = BoxFuture<'static, Result<Option<Payload>, RSocketError>>;

/// Handles requests initiated by the peer.
///
/// Every method has a default that refuses the interaction with an
/// APPLICATION_ERROR, so implementors only override what they serve.
pub trait Responder: Send + Sync + 'static {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, ()> {
        tracing::debug!("dropping fire-and-forget ({} bytes)", payload.len());
        Box::pin(future::ready(()))
    }

    fn request_response(&self, _payload: Payload) -> ResponseFuture {
        Box::pin(future::ready(Err(RSocketError::unsupported(
            "request-response",
        ))))
    }

    fn request_stream(&self, _payload: Payload) -> PayloadFlux {
        Box::pin(stream::once(future::ready(Err(RSocketError::unsupported(
            "request-stream",
        )))))
    }

    /// `first` is the payload carried by REQUEST_CHANNEL; `inbound` yields
    /// the rest of the requester's items once credit is granted with
    /// [`PayloadStream::request`].
    fn request_channel(&self, _first: Payload, _inbound: PayloadStream) -> PayloadFlux {
        Box::pin(stream::once(future::ready(Err(RSocketError::unsupported(
            "request-channel",
        )))))
    }

    fn metadata_push(&self, metadata: Bytes) -> BoxFuture<'static, ()> {
        tracing::debug!("dropping metadata push ({} bytes)", metadata.len());
        Box::pin(future::ready(()))
    }
}

/// A responder that refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResponder;

impl Responder for EmptyResponder {}

/// What the client announced in its SETUP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupPayload {
    pub major_version: u16,
    pub minor_version: u16,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub lease: bool,
    pub resume_token: Option<Bytes>,
    pub payload: Payload,
}

/// Decides whether to accept a connection and with which responder.
///
/// `requester` can be kept to issue requests towards the client. Returning
/// an error rejects the setup with REJECTED_SETUP and the error's message.
pub trait SocketAcceptor: Send + Sync + 'static {
    fn accept(
        &self,
        setup: &SetupPayload,
        requester: RSocket,
    ) -> Result<Arc<dyn Responder>, RSocketError>;
}

impl<F> SocketAcceptor for F
where
    F: Fn(&SetupPayload, RSocket) -> Result<Arc<dyn Responder>, RSocketError> + Send + Sync + 'static,
{
    fn accept(
        &self,
        setup: &SetupPayload,
        requester: RSocket,
    ) -> Result<Arc<dyn Responder>, RSocketError> {
        self(setup, requester)
    }
}
