//! Connection configuration.

use bytes::Bytes;
use rsocket_protocol::fragment::{DEFAULT_MAX_REASSEMBLY_SIZE, DEFAULT_MAX_REASSEMBLY_TOTAL};
use rsocket_protocol::{Frame, Payload, Setup, MAJOR_VERSION, MAX_FRAME_LENGTH, MINOR_VERSION};
use std::time::Duration;

/// Default interval between client keepalives (20 s).
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default max lifetime without inbound frames (90 s).
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Default data and metadata MIME type.
pub const DEFAULT_MIME_TYPE: &str = "application/binary";

/// Default time a server waits for the SETUP frame (10 s).
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest non-zero fragment size (64 bytes).
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Largest fragment size that still leaves room for any frame header.
pub const MAX_FRAGMENT_SIZE: usize = MAX_FRAME_LENGTH - 64;

const MIN_KEEPALIVE: Duration = Duration::from_millis(1);
const MAX_KEEPALIVE: Duration = Duration::from_millis(u32::MAX as u64);

/// Parameters the client announces in SETUP.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupConfig {
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    /// Setup payload handed to the server's acceptor.
    pub payload: Payload,
    /// Whether the client honours leases.
    pub lease: bool,
    pub resume_token: Option<Bytes>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            payload: Payload::default(),
            lease: false,
            resume_token: None,
        }
    }
}

impl SetupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both durations are clamped to 1 ms ..= u32::MAX ms.
    pub fn with_keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.keepalive_interval = interval.clamp(MIN_KEEPALIVE, MAX_KEEPALIVE);
        self.max_lifetime = max_lifetime.clamp(MIN_KEEPALIVE, MAX_KEEPALIVE);
        self
    }

    /// MIME types are truncated to 255 ASCII bytes.
    pub fn with_data_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.data_mime_type = sanitize_mime_type(mime_type.into());
        self
    }

    pub fn with_metadata_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.metadata_mime_type = sanitize_mime_type(mime_type.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_lease(mut self) -> Self {
        self.lease = true;
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<Bytes>) -> Self {
        let mut token: Bytes = token.into();
        token.truncate(usize::from(u16::MAX));
        self.resume_token = Some(token);
        self
    }

    pub(crate) fn to_frame(&self) -> Frame {
        Frame::setup(
            Setup {
                major_version: MAJOR_VERSION,
                minor_version: MINOR_VERSION,
                keepalive_ms: millis_u32(self.keepalive_interval),
                lifetime_ms: millis_u32(self.max_lifetime),
                resume_token: self.resume_token.clone(),
                metadata_mime_type: self.metadata_mime_type.clone(),
                data_mime_type: self.data_mime_type.clone(),
                payload: self.payload.clone(),
            },
            self.lease,
        )
    }
}

fn millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn sanitize_mime_type(mime_type: String) -> String {
    mime_type
        .chars()
        .filter(char::is_ascii)
        .take(usize::from(u8::MAX))
        .collect()
}

/// Engine settings that apply to both ends of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest metadata+data size per frame; 0 disables fragmentation.
    pub fragment_size: usize,
    /// How long a server waits for SETUP after the transport connects.
    pub setup_timeout: Duration,
    /// Largest inbound frame payload rebuilt from fragments.
    pub max_reassembly_size: usize,
    /// Bound on fragment bytes buffered across all streams at once.
    pub max_reassembly_total: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fragment_size: 0,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            max_reassembly_size: DEFAULT_MAX_REASSEMBLY_SIZE,
            max_reassembly_total: DEFAULT_MAX_REASSEMBLY_TOTAL,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-zero sizes are clamped to `MIN_FRAGMENT_SIZE..=MAX_FRAGMENT_SIZE`.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = if size == 0 {
            0
        } else {
            size.clamp(MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE)
        };
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Peers that exceed either bound lose the connection. The total is
    /// raised to at least `max_size`.
    pub fn with_reassembly_limits(mut self, max_size: usize, max_total: usize) -> Self {
        self.max_reassembly_size = max_size;
        self.max_reassembly_total = max_total.max(max_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsocket_protocol::{Body, Flags};

    #[test]
    fn test_default_setup() {
        let config = SetupConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.max_lifetime, Duration::from_secs(90));
        assert_eq!(config.data_mime_type, "application/binary");
        assert!(!config.lease);
    }

    #[test]
    fn test_setup_frame() {
        let frame = SetupConfig::new()
            .with_keepalive(Duration::from_millis(500), Duration::from_secs(2))
            .with_data_mime_type("application/json")
            .with_lease()
            .with_resume_token("abc")
            .to_frame();

        assert!(frame.flags.contains(Flags::LEASE));
        assert!(frame.flags.contains(Flags::RESUME_ENABLE));
        match frame.body {
            Body::Setup(setup) => {
                assert_eq!(setup.keepalive_ms, 500);
                assert_eq!(setup.lifetime_ms, 2000);
                assert_eq!(setup.data_mime_type, "application/json");
                assert_eq!(setup.resume_token, Some(Bytes::from_static(b"abc")));
            }
            other => panic!("expected SETUP, got {:?}", other),
        }
    }

    #[test]
    fn test_keepalive_clamped() {
        let config = SetupConfig::new().with_keepalive(Duration::ZERO, Duration::from_secs(u64::MAX / 4));
        assert_eq!(config.keepalive_interval, Duration::from_millis(1));
        assert_eq!(config.max_lifetime, Duration::from_millis(u64::from(u32::MAX)));
    }

    #[test]
    fn test_mime_type_sanitized() {
        let config = SetupConfig::new().with_data_mime_type("text/plain;é".to_string() + &"x".repeat(300));
        assert!(config.data_mime_type.is_ascii());
        assert_eq!(config.data_mime_type.len(), 255);
    }

    #[test]
    fn test_fragment_size_clamped() {
        assert_eq!(ConnectionConfig::new().with_fragment_size(0).fragment_size, 0);
        assert_eq!(ConnectionConfig::new().with_fragment_size(10).fragment_size, MIN_FRAGMENT_SIZE);
        assert_eq!(
            ConnectionConfig::new().with_fragment_size(usize::MAX).fragment_size,
            MAX_FRAGMENT_SIZE
        );
        assert_eq!(ConnectionConfig::new().with_fragment_size(16_384).fragment_size, 16_384);
    }

    #[test]
    fn test_reassembly_limits() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reassembly_size, 16 * 1024 * 1024);
        assert_eq!(config.max_reassembly_total, 64 * 1024 * 1024);

        let config = ConnectionConfig::new().with_reassembly_limits(4096, 1024);
        assert_eq!(config.max_reassembly_size, 4096);
        assert_eq!(config.max_reassembly_total, 4096);
    }
}
