//! Length-prefixed framing for stream-oriented transports.
//!
//! ```text
//! +-------------------+----------------------------------+
//! | length (u24, BE)  | frame (header + body)            |
//! +-------------------+----------------------------------+
//! ```
//!
//! Message-oriented transports (in-process channels, WebSocket) carry one
//! frame per message and skip this layer.

use crate::error::ProtocolError;
use crate::frame::{Frame, FRAME_HEADER_SIZE};
use crate::MAX_FRAME_LENGTH;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame length prefix in bytes.
pub const LENGTH_FIELD_SIZE: usize = 3;

/// `tokio_util` codec turning a byte stream into [`Frame`]s and back.
///
/// Frames with an unknown type and the IGNORE flag are skipped. Unknown
/// types without IGNORE surface as [`ProtocolError::UnknownFrameType`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Limits accepted and produced frames to `max` bytes (clamped to the
    /// range a 24-bit prefix can describe).
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            max_frame_length: max.clamp(FRAME_HEADER_SIZE, MAX_FRAME_LENGTH),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if src.len() < LENGTH_FIELD_SIZE {
                return Ok(None);
            }

            // Peek at the length without consuming
            let length = (usize::from(src[0]) << 16) | (usize::from(src[1]) << 8) | usize::from(src[2]);
            if length > self.max_frame_length {
                return Err(ProtocolError::FrameTooLarge {
                    size: length,
                    max: self.max_frame_length,
                });
            }

            let total = LENGTH_FIELD_SIZE + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_FIELD_SIZE);
            let frame = src.split_to(length).freeze();
            match Frame::decode(frame) {
                Err(ProtocolError::UnknownFrameType {
                    ignorable: true, ..
                }) => continue,
                other => return other.map(Some),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let length = frame.encoded_len();
        if length > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_length,
            });
        }
        dst.reserve(LENGTH_FIELD_SIZE + length);
        dst.put_uint(length as u64, LENGTH_FIELD_SIZE);
        frame.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Flags;
    use crate::payload::Payload;
    use bytes::Bytes;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_length_prefix() {
        let frame = Frame::cancel(1);
        let buf = encode(frame);
        assert_eq!(&buf[..3], &[0, 0, 6]);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut buf = encode(Frame::request_n(1, 5));
        buf.extend_from_slice(&encode(Frame::cancel(3)));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::request_n(1, 5)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::cancel(3)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_decoding() {
        let full = encode(Frame::payload_next(1, Payload::from_data("hello world"), true));
        let mut codec = FrameCodec::new();

        // Feed partial data
        let mut buf = BytesMut::from(&full[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[2..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Feed the rest
        buf.extend_from_slice(&full[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame.payload().and_then(|p| p.data_utf8()),
            Some("hello world")
        );
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                Frame::payload_next(1, Payload::from_data(vec![0u8; 64]), false),
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 70, max: 16 }));

        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 256, .. }));
    }

    #[test]
    fn test_skips_ignorable_unknown_frame() {
        let mut buf = BytesMut::new();
        buf.put_uint(6, 3);
        buf.put_u32(1);
        buf.put_u16((0x30 << 10) | Flags::IGNORE.bits());
        buf.extend_from_slice(&encode(Frame::cancel(1)));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::cancel(1)));
    }

    #[test]
    fn test_rejects_unknown_frame_without_ignore() {
        let mut buf = BytesMut::new();
        buf.put_uint(6, 3);
        buf.put_u32(1);
        buf.put_u16(0x30 << 10);

        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownFrameType {
                frame_type: 0x30,
                ignorable: false
            })
        ));
    }

    #[test]
    fn test_metadata_push_roundtrip() {
        let frame = Frame::metadata_push(Bytes::from_static(b"routing"));
        let mut buf = encode(frame.clone());
        assert_eq!(FrameCodec::new().decode(&mut buf).unwrap(), Some(frame));
    }
}
