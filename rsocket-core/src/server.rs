//! Server-side setup handshake.

use crate::config::ConnectionConfig;
use crate::error::RSocketError;
use crate::multiplexer::{self, Settings};
use crate::registry::Side;
use crate::responder::{SetupPayload, SocketAcceptor};
use crate::resume::{InMemoryResumeStore, ResumeStore};
use crate::socket::RSocket;
use crate::transport::{FrameSink, Transport};
use futures::{SinkExt, StreamExt};
use rsocket_protocol::{Body, ErrorCode, Flags, Frame, MAJOR_VERSION};
use std::sync::Arc;
use std::time::Duration;

/// Runs the server side of the setup handshake on a fresh transport.
///
/// Waits for SETUP, validates it, asks `acceptor` for a responder and starts
/// the connection. The returned socket issues requests towards the client.
/// Invalid or rejected setups are answered with the matching ERROR frame on
/// stream 0 before the transport is closed.
pub async fn accept(
    transport: Transport,
    acceptor: Arc<dyn SocketAcceptor>,
    config: &ConnectionConfig,
) -> Result<RSocket, RSocketError> {
    let (mut sink, mut inbound) = transport.into_parts();

    let first = tokio::time::timeout(config.setup_timeout, inbound.next())
        .await
        .map_err(|_| RSocketError::Timeout)?;
    let frame = match first {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => {
            return Err(reject(&mut sink, ErrorCode::InvalidSetup, err.to_string()).await)
        }
        None => return Err(RSocketError::ConnectionClosed),
    };

    let lease = frame.flags.contains(Flags::LEASE);
    let setup = match frame.body {
        Body::Setup(setup) => setup,
        Body::Resume(_) => {
            return Err(reject(
                &mut sink,
                ErrorCode::RejectedResume,
                "no resumable session for this token".to_string(),
            )
            .await)
        }
        other => {
            return Err(reject(
                &mut sink,
                ErrorCode::InvalidSetup,
                format!("expected SETUP, got {}", other.frame_type()),
            )
            .await)
        }
    };

    if setup.major_version != MAJOR_VERSION {
        return Err(reject(
            &mut sink,
            ErrorCode::UnsupportedSetup,
            format!(
                "unsupported version {}.{}",
                setup.major_version, setup.minor_version
            ),
        )
        .await);
    }
    if setup.keepalive_ms == 0 || setup.lifetime_ms == 0 {
        return Err(reject(
            &mut sink,
            ErrorCode::InvalidSetup,
            "keepalive interval and max lifetime must be positive".to_string(),
        )
        .await);
    }

    let setup_payload = SetupPayload {
        major_version: setup.major_version,
        minor_version: setup.minor_version,
        keepalive_interval: Duration::from_millis(u64::from(setup.keepalive_ms)),
        max_lifetime: Duration::from_millis(u64::from(setup.lifetime_ms)),
        metadata_mime_type: setup.metadata_mime_type,
        data_mime_type: setup.data_mime_type,
        lease,
        resume_token: setup.resume_token,
        payload: setup.payload,
    };

    let (socket, commands) = multiplexer::channel(lease);
    let responder = match acceptor.accept(&setup_payload, socket.clone()) {
        Ok(responder) => responder,
        Err(err) => {
            return Err(reject(&mut sink, ErrorCode::RejectedSetup, err.message()).await);
        }
    };

    tracing::info!(
        "setup accepted (data {}, metadata {}, keepalive {:?}, lease {})",
        setup_payload.data_mime_type,
        setup_payload.metadata_mime_type,
        setup_payload.keepalive_interval,
        lease
    );

    let settings = Settings {
        side: Side::Server,
        fragment_size: config.fragment_size,
        max_reassembly_size: config.max_reassembly_size,
        max_reassembly_total: config.max_reassembly_total,
        keepalive_interval: setup_payload.keepalive_interval,
        max_lifetime: setup_payload.max_lifetime,
        send_keepalive: false,
        lease,
        resume: setup_payload.resume_token.as_ref().map(|_| {
            Box::new(InMemoryResumeStore::default()) as Box<dyn ResumeStore>
        }),
    };
    multiplexer::spawn(
        settings,
        &socket,
        commands,
        responder,
        sink,
        inbound,
        Vec::new(),
    );
    Ok(socket)
}

async fn reject(sink: &mut FrameSink, code: ErrorCode, message: String) -> RSocketError {
    tracing::warn!("rejecting setup: {} - {}", code, message);
    if let Err(err) = sink.send(Frame::error(0, code, message.clone())).await {
        tracing::debug!("failed to send setup error: {}", err);
    }
    let _ = sink.close().await;
    RSocketError::Connection { code, message }
}
