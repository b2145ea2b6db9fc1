//! Protocol error types and error codes.

use crate::frame::FrameType;
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding, decoding or reassembling frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {field}: {reason}")]
    MalformedFrame { field: &'static str, reason: String },

    #[error("unknown frame type: {frame_type:#04x}")]
    UnknownFrameType { frame_type: u8, ignorable: bool },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unexpected {frame_type} frame while reassembling stream {stream_id}")]
    UnexpectedFragment {
        stream_id: u32,
        frame_type: FrameType,
    },

    #[error("reassembly of stream {stream_id} exceeds {max} bytes ({size} buffered)")]
    ReassemblyLimit {
        stream_id: u32,
        size: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl ProtocolError {
    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame {
            field,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Error codes carried by ERROR frames.
///
/// The numeric values are part of the protocol contract. Codes outside the
/// reserved set (for example application-defined ones) survive a decode and
/// re-encode unchanged through [`ErrorCode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Setup errors (stream 0 only)
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    RejectedResume,

    // Connection errors (stream 0 only)
    ConnectionError,
    ConnectionClose,

    // Stream errors
    ApplicationError,
    Rejected,
    Canceled,
    Invalid,

    Custom(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000_0001 => ErrorCode::InvalidSetup,
            0x0000_0002 => ErrorCode::UnsupportedSetup,
            0x0000_0003 => ErrorCode::RejectedSetup,
            0x0000_0004 => ErrorCode::RejectedResume,
            0x0000_0101 => ErrorCode::ConnectionError,
            0x0000_0102 => ErrorCode::ConnectionClose,
            0x0000_0201 => ErrorCode::ApplicationError,
            0x0000_0202 => ErrorCode::Rejected,
            0x0000_0203 => ErrorCode::Canceled,
            0x0000_0204 => ErrorCode::Invalid,
            other => ErrorCode::Custom(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::InvalidSetup => 0x0000_0001,
            ErrorCode::UnsupportedSetup => 0x0000_0002,
            ErrorCode::RejectedSetup => 0x0000_0003,
            ErrorCode::RejectedResume => 0x0000_0004,
            ErrorCode::ConnectionError => 0x0000_0101,
            ErrorCode::ConnectionClose => 0x0000_0102,
            ErrorCode::ApplicationError => 0x0000_0201,
            ErrorCode::Rejected => 0x0000_0202,
            ErrorCode::Canceled => 0x0000_0203,
            ErrorCode::Invalid => 0x0000_0204,
            ErrorCode::Custom(code) => *code,
        }
    }

    /// Returns whether this code may only appear on stream 0.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidSetup
                | ErrorCode::UnsupportedSetup
                | ErrorCode::RejectedSetup
                | ErrorCode::RejectedResume
                | ErrorCode::ConnectionError
                | ErrorCode::ConnectionClose
        )
    }

    /// Returns whether this code answers a SETUP or RESUME frame.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidSetup
                | ErrorCode::UnsupportedSetup
                | ErrorCode::RejectedSetup
                | ErrorCode::RejectedResume
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidSetup => "INVALID_SETUP",
            ErrorCode::UnsupportedSetup => "UNSUPPORTED_SETUP",
            ErrorCode::RejectedSetup => "REJECTED_SETUP",
            ErrorCode::RejectedResume => "REJECTED_RESUME",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::ConnectionClose => "CONNECTION_CLOSE",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Invalid => "INVALID",
            ErrorCode::Custom(code) => return write!(f, "0x{:08X}", code),
        };
        write!(f, "{}", s)
    }
}
