//! Transport abstraction.
//!
//! The engine only needs an ordered, reliable, full-duplex frame pipe: a
//! sink for outbound frames and a stream of inbound ones. Byte-stream I/O
//! gets there through [`FrameCodec`]; in-process pairs skip encoding
//! entirely.

use crate::error::RSocketError;
use futures::channel::mpsc;
use futures::sink::{Sink, SinkExt};
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use rsocket_protocol::{Frame, FrameCodec};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RSocketError> + Send>>;

/// Inbound half of a transport.
pub type FrameStream = BoxStream<'static, Result<Frame, RSocketError>>;

/// A connected frame pipe handed to a client connector or server acceptor.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<Frame, Error = RSocketError> + Send + 'static,
        T: Stream<Item = Result<Frame, RSocketError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Wraps a byte stream (TCP, Unix socket, duplex pipe) with the
    /// 24-bit length-prefixed frame codec.
    pub fn from_io<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_io_with_codec(io, FrameCodec::new())
    }

    pub fn from_io_with_codec<IO>(io: IO, codec: FrameCodec) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = Framed::new(io, codec).split::<Frame>();
        Self::new(
            sink.sink_map_err(RSocketError::from),
            stream.map_err(RSocketError::from),
        )
    }

    /// Two connected message-oriented transports sharing nothing but a pair
    /// of in-memory channels. Frames are moved, not encoded.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded::<Frame>();
        let (b_tx, b_rx) = mpsc::unbounded::<Frame>();
        (Self::from_channel(a_tx, b_rx), Self::from_channel(b_tx, a_rx))
    }

    /// Two connected byte-stream transports over an in-memory duplex pipe.
    /// Frames go through the length-prefixed codec like they would on TCP.
    pub fn duplex(max_buf_size: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Self::from_io(a), Self::from_io(b))
    }

    fn from_channel(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self::new(
            tx.sink_map_err(|err| RSocketError::Transport(err.to_string())),
            rx.map(Ok),
        )
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsocket_protocol::Payload;

    #[tokio::test]
    async fn test_pair_moves_frames_both_ways() {
        let (a, b) = Transport::pair();
        let (mut a_sink, mut a_stream) = a.into_parts();
        let (mut b_sink, mut b_stream) = b.into_parts();

        a_sink.send(Frame::request_n(1, 3)).await.unwrap();
        assert_eq!(b_stream.next().await.unwrap().unwrap(), Frame::request_n(1, 3));

        b_sink.send(Frame::cancel(1)).await.unwrap();
        assert_eq!(a_stream.next().await.unwrap().unwrap(), Frame::cancel(1));
    }

    #[tokio::test]
    async fn test_pair_close_ends_peer_stream() {
        let (a, b) = Transport::pair();
        let (mut a_sink, _a_stream) = a.into_parts();
        let (_b_sink, mut b_stream) = b.into_parts();

        a_sink.close().await.unwrap();
        assert!(b_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_duplex_uses_codec() {
        let (a, b) = Transport::duplex(64);
        let (mut a_sink, _a_stream) = a.into_parts();
        let (_b_sink, mut b_stream) = b.into_parts();

        // larger than the pipe buffer, so it is written in pieces
        let frame = Frame::payload_next(1, Payload::from_data(vec![5u8; 1000]), true);
        let send = tokio::spawn(async move {
            a_sink.send(frame).await.unwrap();
            a_sink
        });
        let received = b_stream.next().await.unwrap().unwrap();
        assert_eq!(received.payload().map(|p| p.len()), Some(1000));
        send.await.unwrap();
    }
}
