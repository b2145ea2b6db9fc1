//! Client-side connection setup.

use crate::config::{ConnectionConfig, SetupConfig};
use crate::error::RSocketError;
use crate::multiplexer::{self, Settings};
use crate::registry::Side;
use crate::responder::{EmptyResponder, Responder};
use crate::resume::{InMemoryResumeStore, ResumeStore};
use crate::socket::RSocket;
use crate::transport::Transport;
use std::sync::Arc;

/// Builds and opens client connections.
///
/// ```no_run
/// # async fn demo() -> Result<(), rsocket_core::RSocketError> {
/// use rsocket_core::{RSocketConnector, SetupConfig, Transport};
///
/// let (client_side, _server_side) = Transport::pair();
/// let socket = RSocketConnector::new()
///     .with_setup(SetupConfig::new().with_data_mime_type("text/plain"))
///     .connect(client_side)
///     .await?;
/// let answer = socket.request_response("ping".into()).await?;
/// # Ok(())
/// # }
/// ```
pub struct RSocketConnector {
    setup: SetupConfig,
    config: ConnectionConfig,
    responder: Arc<dyn Responder>,
    resume_store: Option<Box<dyn ResumeStore>>,
}

impl Default for RSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RSocketConnector {
    pub fn new() -> Self {
        Self {
            setup: SetupConfig::default(),
            config: ConnectionConfig::default(),
            responder: Arc::new(EmptyResponder),
            resume_store: None,
        }
    }

    pub fn with_setup(mut self, setup: SetupConfig) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler for requests the server sends to this client.
    pub fn with_responder(mut self, responder: impl Responder) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Enables resumption bookkeeping with a generated token and an
    /// in-memory frame buffer.
    pub fn with_resume(self) -> Self {
        let token = uuid::Uuid::new_v4().as_bytes().to_vec();
        self.with_resume_store(token, Box::new(InMemoryResumeStore::default()))
    }

    pub fn with_resume_store(mut self, token: Vec<u8>, store: Box<dyn ResumeStore>) -> Self {
        self.setup = self.setup.with_resume_token(token);
        self.resume_store = Some(store);
        self
    }

    /// Sends SETUP over `transport` and starts the connection.
    ///
    /// RSocket has no SETUP acknowledgement: a server that rejects the setup
    /// answers with an ERROR frame, which closes the returned socket.
    pub async fn connect(self, transport: Transport) -> Result<RSocket, RSocketError> {
        let setup = self.setup.to_frame();
        let (sink, inbound) = transport.into_parts();
        let (socket, commands) = multiplexer::channel(self.setup.lease);

        tracing::debug!(
            "sending SETUP (data {}, metadata {}, lease {})",
            self.setup.data_mime_type,
            self.setup.metadata_mime_type,
            self.setup.lease
        );
        let settings = Settings {
            side: Side::Client,
            fragment_size: self.config.fragment_size,
            max_reassembly_size: self.config.max_reassembly_size,
            max_reassembly_total: self.config.max_reassembly_total,
            keepalive_interval: self.setup.keepalive_interval,
            max_lifetime: self.setup.max_lifetime,
            send_keepalive: true,
            lease: self.setup.lease,
            resume: self.resume_store,
        };
        multiplexer::spawn(
            settings,
            &socket,
            commands,
            self.responder,
            sink,
            inbound,
            vec![setup],
        );
        Ok(socket)
    }
}
