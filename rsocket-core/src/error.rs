//! Engine error types.

use rsocket_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors surfaced to requesters, responders and connection owners.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RSocketError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("protocol violation on stream {stream_id}: {reason}")]
    ProtocolViolation { stream_id: u32, reason: String },

    #[error("connection error: {code} - {message}")]
    Connection { code: ErrorCode, message: String },

    #[error("application error: {code} - {message}")]
    Application { code: ErrorCode, message: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("stream cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    #[error("timed out")]
    Timeout,
}

impl RSocketError {
    /// An APPLICATION_ERROR with the given message.
    pub fn application(message: impl Into<String>) -> Self {
        RSocketError::Application {
            code: ErrorCode::ApplicationError,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(interaction: &str) -> Self {
        Self::application(format!("{} not supported", interaction))
    }

    /// Error code to put in an ERROR frame for a stream failed with `self`.
    pub fn stream_error_code(&self) -> ErrorCode {
        match self {
            RSocketError::Application { code, .. } if !code.is_connection_level() => *code,
            RSocketError::Rejected(_) => ErrorCode::Rejected,
            RSocketError::Cancelled => ErrorCode::Canceled,
            RSocketError::ProtocolViolation { .. } | RSocketError::InvalidArgument(_) => {
                ErrorCode::Invalid
            }
            _ => ErrorCode::ApplicationError,
        }
    }

    /// Message to put in an ERROR frame for `self`.
    pub fn message(&self) -> String {
        match self {
            RSocketError::Application { message, .. }
            | RSocketError::Connection { message, .. }
            | RSocketError::Rejected(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns whether this error ends the whole connection rather than one stream.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RSocketError::Protocol(_)
                | RSocketError::Connection { .. }
                | RSocketError::ConnectionClosed
                | RSocketError::Transport(_)
                | RSocketError::StreamIdsExhausted
        )
    }
}

impl From<std::io::Error> for RSocketError {
    fn from(err: std::io::Error) -> Self {
        RSocketError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_code_mapping() {
        assert_eq!(
            RSocketError::application("boom").stream_error_code(),
            ErrorCode::ApplicationError
        );
        assert_eq!(
            RSocketError::Application {
                code: ErrorCode::Custom(0x301),
                message: String::new()
            }
            .stream_error_code(),
            ErrorCode::Custom(0x301)
        );
        // connection-level codes never leak onto a stream
        assert_eq!(
            RSocketError::Application {
                code: ErrorCode::ConnectionClose,
                message: String::new()
            }
            .stream_error_code(),
            ErrorCode::ApplicationError
        );
        assert_eq!(
            RSocketError::Rejected("busy".into()).stream_error_code(),
            ErrorCode::Rejected
        );
        assert_eq!(RSocketError::Cancelled.stream_error_code(), ErrorCode::Canceled);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(RSocketError::application("boom").message(), "boom");
        assert_eq!(RSocketError::Cancelled.message(), "stream cancelled");
        assert_eq!(
            RSocketError::Connection {
                code: ErrorCode::ConnectionError,
                message: "bad frame".into()
            }
            .to_string(),
            "connection error: CONNECTION_ERROR - bad frame"
        );
    }

    #[test]
    fn test_is_connection_fatal() {
        assert!(RSocketError::ConnectionClosed.is_connection_fatal());
        assert!(RSocketError::StreamIdsExhausted.is_connection_fatal());
        assert!(!RSocketError::Cancelled.is_connection_fatal());
        assert!(!RSocketError::application("x").is_connection_fatal());
    }
}
