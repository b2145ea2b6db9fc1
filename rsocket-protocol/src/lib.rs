//! # rsocket-protocol
//!
//! Wire protocol implementation for RSocket 1.0.
//!
//! This crate provides:
//! - Binary layouts for every RSocket frame type
//! - Frame flags, type codes and the stable error code set
//! - Payload fragmentation and per-stream reassembly
//! - A 24-bit length-prefixed codec for stream-oriented transports
//!
//! The crate is sans-IO: nothing here touches a socket or a runtime.

pub mod codec;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod payload;

pub use codec::{FrameCodec, LENGTH_FIELD_SIZE};
pub use error::{ErrorCode, ProtocolError};
pub use fragment::{fragment, needs_fragmentation, Reassembler};
pub use frame::{
    Body, Flags, Frame, FrameType, Keepalive, Lease, Resume, Setup, FRAME_HEADER_SIZE,
};
pub use payload::Payload;

/// Major protocol version written in SETUP and RESUME frames.
pub const MAJOR_VERSION: u16 = 1;

/// Minor protocol version written in SETUP and RESUME frames.
pub const MINOR_VERSION: u16 = 0;

/// Largest valid stream id (stream ids are 31-bit).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Largest request-n value. A grant of this size means "unbounded".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Largest frame a 24-bit length prefix can describe (16 MiB - 1).
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;
