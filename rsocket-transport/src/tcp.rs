//! TCP client connections.

use crate::error::TransportError;
use rsocket_core::Transport;
use rsocket_protocol::FrameCodec;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default TCP connect timeout (10 s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a TCP connection to `addr` and wraps it as a frame transport.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Transport, TransportError> {
    tracing::debug!("connecting to {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectTimeout(addr))??;
    tracing::debug!("TCP connected to {}", addr);
    Ok(wrap(stream, FrameCodec::new()))
}

/// Wraps an established TCP stream with TCP_NODELAY set.
pub fn wrap(stream: TcpStream, codec: FrameCodec) -> Transport {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY: {}", err);
    }
    Transport::from_io_with_codec(stream, codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use rsocket_protocol::{Frame, Payload};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut sink, mut inbound) = wrap(stream, FrameCodec::new()).into_parts();
            let frame = inbound.next().await.unwrap().unwrap();
            sink.send(frame).await.unwrap();
        });

        let (mut sink, mut inbound) = connect(addr, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap()
            .into_parts();
        let frame = Frame::request_fnf(1, Payload::new("data", Some("meta".into())));
        sink.send(frame.clone()).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), frame);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect(addr, DEFAULT_CONNECT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
