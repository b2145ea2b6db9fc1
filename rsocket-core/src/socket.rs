//! The requester handle and inbound item streams.

use crate::error::RSocketError;
use crate::lease::LeaseTracker;
use crate::multiplexer::Command;
use crate::stream::StreamEvent;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use rsocket_protocol::{Payload, MAX_REQUEST_N};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// State shared between handles and the connection task.
pub(crate) struct Shared {
    closed: CancellationToken,
    close_reason: Mutex<Option<RSocketError>>,
    /// Leases received from the peer (requester side).
    pub(crate) lease: Mutex<LeaseTracker>,
    pub(crate) lease_enabled: bool,
}

impl Shared {
    pub(crate) fn new(lease_enabled: bool) -> Self {
        Self {
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            lease: Mutex::new(LeaseTracker::new()),
            lease_enabled,
        }
    }

    pub(crate) fn mark_closed(&self, reason: RSocketError) {
        self.close_reason.lock().get_or_insert(reason);
        self.closed.cancel();
    }
}

/// Handle for issuing requests on a connection.
///
/// Cheap to clone; all clones talk to the same connection task. Once the
/// connection has closed every operation fails with
/// [`RSocketError::ConnectionClosed`].
#[derive(Clone)]
pub struct RSocket {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RSocket {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    pub(crate) fn commands(&self) -> &mpsc::UnboundedSender<Command> {
        &self.commands
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn submit(&self, command: Command) -> Result<(), RSocketError> {
        if self.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        self.commands
            .send(command)
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    async fn await_reply<T>(
        rx: oneshot::Receiver<Result<T, RSocketError>>,
    ) -> Result<T, RSocketError> {
        rx.await.map_err(|_| RSocketError::ConnectionClosed)?
    }

    /// Sends a payload with no response. Resolves once the frame is queued.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), RSocketError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::FireAndForget { payload, reply })?;
        Self::await_reply(rx).await.map(|_| ())
    }

    /// Sends a request and waits for its single response.
    ///
    /// `Ok(None)` means the responder completed without a value. Dropping the
    /// returned future before it resolves cancels the request.
    pub async fn request_response(&self, payload: Payload) -> Result<Option<Payload>, RSocketError> {
        let guard = CancelOnDrop::new(&self.commands);
        let (reply, id_rx) = oneshot::channel();
        let (response, rx) = oneshot::channel();
        self.submit(Command::RequestResponse {
            payload,
            pending: guard.slot(),
            reply,
            response,
        })?;
        Self::await_reply(id_rx).await?;

        let result = rx.await.map_err(|_| RSocketError::ConnectionClosed)?;
        guard.disarm();
        result
    }

    /// Opens a request-stream with `initial_request_n` items of credit.
    pub async fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
    ) -> Result<PayloadStream, RSocketError> {
        let initial_request_n = validate_request_n(initial_request_n)?;
        let guard = CancelOnDrop::new(&self.commands);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.submit(Command::RequestStream {
            payload,
            initial_request_n,
            events,
            pending: guard.slot(),
            reply,
        })?;
        let stream_id = Self::await_reply(rx).await?;
        guard.disarm();
        Ok(PayloadStream::new(
            stream_id,
            events_rx,
            self.commands.clone(),
        ))
    }

    /// Opens a request-channel. The first item of `outbound` travels in the
    /// REQUEST_CHANNEL frame; later items are sent as the responder grants
    /// credit. `outbound` must yield at least one item.
    pub async fn request_channel<S>(
        &self,
        outbound: S,
        initial_request_n: u32,
    ) -> Result<PayloadStream, RSocketError>
    where
        S: Stream<Item = Result<Payload, RSocketError>> + Send + 'static,
    {
        let initial_request_n = validate_request_n(initial_request_n)?;
        let mut outbound: BoxStream<'static, Result<Payload, RSocketError>> = outbound.boxed();
        let first = match outbound.next().await {
            Some(item) => item?,
            None => {
                return Err(RSocketError::InvalidArgument(
                    "request-channel needs at least one payload".to_string(),
                ))
            }
        };

        let guard = CancelOnDrop::new(&self.commands);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.submit(Command::RequestChannel {
            first,
            rest: outbound,
            initial_request_n,
            events,
            pending: guard.slot(),
            reply,
        })?;
        let stream_id = Self::await_reply(rx).await?;
        guard.disarm();
        Ok(PayloadStream::new(
            stream_id,
            events_rx,
            self.commands.clone(),
        ))
    }

    /// Pushes connection-level metadata to the peer.
    pub async fn metadata_push(&self, metadata: impl Into<Bytes>) -> Result<(), RSocketError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::MetadataPush {
            metadata: metadata.into(),
            reply,
        })?;
        Self::await_reply(rx).await
    }

    /// Grants the peer `request_count` requests valid for `ttl`.
    ///
    /// Fails with `InvalidArgument` unless leasing was negotiated in SETUP.
    pub async fn lease(
        &self,
        ttl: Duration,
        request_count: u32,
        metadata: Option<Bytes>,
    ) -> Result<(), RSocketError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Lease {
            ttl,
            request_count,
            metadata,
            reply,
        })?;
        Self::await_reply(rx).await
    }

    /// Closes the connection with ERROR(CONNECTION_CLOSE). Every live stream
    /// fails with `ConnectionClosed`. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.submit(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
        self.closed().await;
    }

    /// Resolves when the connection has terminated, with the reason.
    pub async fn closed(&self) -> RSocketError {
        self.shared.closed.cancelled().await;
        self.close_reason()
            .unwrap_or(RSocketError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<RSocketError> {
        self.shared.close_reason.lock().clone()
    }

    /// Share of lease capacity left: 1.0 without leasing, 0.0 when closed or
    /// without a valid lease.
    pub fn availability(&self) -> f64 {
        if self.is_closed() {
            return 0.0;
        }
        if !self.shared.lease_enabled {
            return 1.0;
        }
        self.shared.lease.lock().availability()
    }
}

impl std::fmt::Debug for RSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RSocket")
            .field("closed", &self.is_closed())
            .field("lease_enabled", &self.shared.lease_enabled)
            .finish()
    }
}

fn validate_request_n(n: u32) -> Result<u32, RSocketError> {
    if n == 0 {
        return Err(RSocketError::InvalidArgument(
            "request-n must be greater than zero".to_string(),
        ));
    }
    Ok(n.min(MAX_REQUEST_N))
}

/// Where a request stands between being queued and its caller learning
/// the stream id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    #[default]
    Queued,
    Open(u32),
    /// The caller went away; the connection task must not open the stream.
    Abandoned,
}

/// Shared between a request future and the connection task.
pub(crate) type PendingSlot = Arc<Mutex<Pending>>;

/// Cancels a request whose future is dropped before it resolves, including
/// while the stream id is still on its way back.
struct CancelOnDrop {
    slot: PendingSlot,
    commands: mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(commands: &mpsc::UnboundedSender<Command>) -> Self {
        Self {
            slot: PendingSlot::default(),
            commands: commands.clone(),
            armed: true,
        }
    }

    fn slot(&self) -> PendingSlot {
        self.slot.clone()
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.slot.lock();
        if let Pending::Open(stream_id) = *slot {
            let _ = self.commands.send(Command::Signal {
                stream_id,
                event: StreamEvent::Cancel,
            });
        }
        *slot = Pending::Abandoned;
    }
}

/// Items arriving on a request-stream or either side of a request-channel.
///
/// Yields `Ok(payload)` per item, then ends on completion or after yielding
/// one `Err`. More items must be requested with [`PayloadStream::request`]
/// once the initial credit is spent. Dropping an unfinished stream cancels it.
pub struct PayloadStream {
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedSender<Command>,
    done: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        stream_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            stream_id,
            events,
            commands,
            done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn signal(&self, event: StreamEvent) {
        let _ = self.commands.send(Command::Signal {
            stream_id: self.stream_id,
            event,
        });
    }

    /// Asks the peer for `n` more items.
    pub fn request(&self, n: u32) {
        if !self.done && n > 0 {
            self.signal(StreamEvent::RequestN(n.min(MAX_REQUEST_N)));
        }
    }

    /// Cancels the stream. Items already in flight are discarded.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.signal(StreamEvent::Cancel);
        }
    }

    /// Sends an EXT frame on this stream.
    pub fn send_extension(&self, extended_type: u32, payload: Payload) {
        if !self.done {
            self.signal(StreamEvent::Extension {
                extended_type,
                payload,
            });
        }
    }

    /// Next raw event, including extension frames that the `Stream`
    /// implementation skips.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(StreamEvent::Complete)
            | Some(StreamEvent::Error(_))
            | Some(StreamEvent::Next { complete: true, .. })
            | None => self.done = true,
            _ => {}
        }
        event
    }
}

impl Stream for PayloadStream {
    type Item = Result<Payload, RSocketError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            let event = match self.events.poll_recv(cx) {
                Poll::Ready(event) => event,
                Poll::Pending => return Poll::Pending,
            };
            match event {
                Some(StreamEvent::Next { payload, complete }) => {
                    self.done = complete;
                    return Poll::Ready(Some(Ok(payload)));
                }
                Some(StreamEvent::Complete) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Some(StreamEvent::Error(err)) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Some(_) => continue,
                None => {
                    self.done = true;
                    return Poll::Ready(Some(Err(RSocketError::ConnectionClosed)));
                }
            }
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStream")
            .field("stream_id", &self.stream_id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RSocketConnector;
    use crate::config::{ConnectionConfig, SetupConfig};
    use crate::responder::{PayloadFlux, Responder, ResponseFuture, SetupPayload, SocketAcceptor};
    use crate::server::accept;
    use crate::transport::Transport;
    use futures::future::{self, BoxFuture};
    use futures::stream;
    use rsocket_protocol::ErrorCode;
    use tokio_test::{assert_pending, assert_ready};

    /// Echoes requests; "fail" errors, "empty" completes without a value and
    /// a numeric request-stream payload yields that many items.
    #[derive(Clone)]
    struct TestResponder {
        received: mpsc::UnboundedSender<Payload>,
    }

    impl Responder for TestResponder {
        fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, ()> {
            let _ = self.received.send(payload);
            Box::pin(future::ready(()))
        }

        fn request_response(&self, payload: Payload) -> ResponseFuture {
            let result = match payload.data_utf8() {
                Some("fail") => Err(RSocketError::application("boom")),
                Some("empty") => Ok(None),
                _ => Ok(Some(payload)),
            };
            Box::pin(future::ready(result))
        }

        fn request_stream(&self, payload: Payload) -> PayloadFlux {
            let count: usize = payload.data_utf8().and_then(|s| s.parse().ok()).unwrap_or(0);
            stream::iter((0..count).map(|i| Ok(Payload::from(format!("item-{}", i))))).boxed()
        }

        fn request_channel(&self, first: Payload, inbound: PayloadStream) -> PayloadFlux {
            inbound.request(16);
            stream::once(future::ready(Ok(first))).chain(inbound).boxed()
        }

        fn metadata_push(&self, metadata: Bytes) -> BoxFuture<'static, ()> {
            let _ = self.received.send(Payload::new(Bytes::new(), Some(metadata)));
            Box::pin(future::ready(()))
        }
    }

    struct Harness {
        client: RSocket,
        server: RSocket,
        received: mpsc::UnboundedReceiver<Payload>,
    }

    async fn harness_with(setup: SetupConfig, config: ConnectionConfig) -> Harness {
        harness_over(setup, config, Transport::pair()).await
    }

    async fn harness_over(
        setup: SetupConfig,
        config: ConnectionConfig,
        (client_side, server_side): (Transport, Transport),
    ) -> Harness {
        let (received_tx, received) = mpsc::unbounded_channel();
        let responder = TestResponder {
            received: received_tx,
        };
        let acceptor: Arc<dyn SocketAcceptor> = Arc::new(
            move |_: &SetupPayload, _: RSocket| -> Result<Arc<dyn Responder>, RSocketError> {
                Ok(Arc::new(responder.clone()))
            },
        );

        let server_config = config.clone();
        let server =
            tokio::spawn(async move { accept(server_side, acceptor, &server_config).await });
        let (client_received, _) = mpsc::unbounded_channel();
        let client = RSocketConnector::new()
            .with_setup(setup)
            .with_config(config)
            .with_responder(TestResponder {
                received: client_received,
            })
            .connect(client_side)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();
        Harness {
            client,
            server,
            received,
        }
    }

    async fn harness() -> Harness {
        harness_with(SetupConfig::default(), ConnectionConfig::default()).await
    }

    #[tokio::test]
    async fn test_request_response_echo() {
        let h = harness().await;
        let request = Payload::new("hello", Some(Bytes::from_static(b"m")));
        let response = h.client.request_response(request.clone()).await.unwrap();
        assert_eq!(response, Some(request));
    }

    #[tokio::test]
    async fn test_request_response_empty_and_error() {
        let h = harness().await;
        assert_eq!(h.client.request_response("empty".into()).await.unwrap(), None);

        let err = h.client.request_response("fail".into()).await.unwrap_err();
        assert_eq!(
            err,
            RSocketError::Application {
                code: ErrorCode::ApplicationError,
                message: "boom".to_string()
            }
        );
        // Connection survives stream errors
        assert!(!h.client.is_closed());
        assert!(h.client.request_response("again".into()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_stream_honours_credit() {
        let h = harness().await;
        let mut items = h.client.request_stream("5".into(), 2).await.unwrap();

        assert_eq!(items.next().await.unwrap().unwrap().data_utf8(), Some("item-0"));
        assert_eq!(items.next().await.unwrap().unwrap().data_utf8(), Some("item-1"));
        let stalled = tokio::time::timeout(Duration::from_millis(100), items.next()).await;
        assert!(stalled.is_err(), "no items beyond the granted credit");

        items.request(10);
        let rest: Vec<_> = items.map(|item| item.unwrap()).collect().await;
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2].data_utf8(), Some("item-4"));
    }

    #[tokio::test]
    async fn test_request_stream_empty_completes() {
        let h = harness().await;
        let mut items = h.client.request_stream("0".into(), 8).await.unwrap();
        assert!(items.next().await.is_none());
        assert!(items.is_done());
    }

    #[tokio::test]
    async fn test_request_stream_rejects_zero_credit() {
        let h = harness().await;
        let err = h.client.request_stream("1".into(), 0).await.unwrap_err();
        assert!(matches!(err, RSocketError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_request_channel_echo() {
        let h = harness().await;
        let outbound = stream::iter(vec![
            Ok(Payload::from("a")),
            Ok(Payload::from("b")),
            Ok(Payload::from("c")),
        ]);
        let inbound = h.client.request_channel(outbound, 10).await.unwrap();
        let echoed: Vec<String> = inbound
            .map(|item| item.unwrap().data_utf8().unwrap().to_string())
            .collect()
            .await;
        assert_eq!(echoed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_request_channel_needs_first_item() {
        let h = harness().await;
        let err = h
            .client
            .request_channel(stream::empty(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_fire_and_forget_and_metadata_push() {
        let mut h = harness().await;
        h.client.fire_and_forget("event".into()).await.unwrap();
        assert_eq!(h.received.recv().await.unwrap().data_utf8(), Some("event"));

        h.client.metadata_push("routing").await.unwrap();
        let pushed = h.received.recv().await.unwrap();
        assert_eq!(pushed.metadata_utf8(), Some("routing"));
    }

    #[tokio::test]
    async fn test_server_requests_client() {
        let h = harness().await;
        let response = h.server.request_response("from server".into()).await.unwrap();
        assert_eq!(response.unwrap().data_utf8(), Some("from server"));
    }

    #[tokio::test]
    async fn test_fragmented_request_response() {
        let config = ConnectionConfig::new().with_fragment_size(16_384);
        let h = harness_with(SetupConfig::default(), config).await;
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let request = Payload::new(data, Some(Bytes::from_static(b"meta")));
        let response = h.client.request_response(request.clone()).await.unwrap();
        assert_eq!(response, Some(request));
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_only_its_caller() {
        let h = harness_over(
            SetupConfig::default(),
            ConnectionConfig::default(),
            Transport::duplex(64 * 1024),
        )
        .await;
        let huge = vec![0u8; 17 * 1024 * 1024];

        let err = h
            .client
            .request_response(Payload::from_data(huge.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::InvalidArgument(_)));
        let err = h.client.metadata_push(huge).await.unwrap_err();
        assert!(matches!(err, RSocketError::InvalidArgument(_)));

        assert!(!h.client.is_closed());
        let response = h.client.request_response("still here".into()).await.unwrap();
        assert_eq!(response.unwrap().data_utf8(), Some("still here"));
        // No stream id was spent on the rejected request
        let mut items = h.client.request_stream("1".into(), 1).await.unwrap();
        assert_eq!(items.stream_id(), 3);
        assert!(items.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_everything() {
        let h = harness().await;
        let mut items = h.client.request_stream("3".into(), 1).await.unwrap();
        assert!(items.next().await.unwrap().is_ok());

        h.client.close().await;
        assert!(h.client.is_closed());
        assert_eq!(items.next().await, Some(Err(RSocketError::ConnectionClosed)));
        assert_eq!(
            h.client.request_response("late".into()).await,
            Err(RSocketError::ConnectionClosed)
        );

        let reason = h.server.closed().await;
        assert!(matches!(
            reason,
            RSocketError::Connection {
                code: ErrorCode::ConnectionClose,
                ..
            }
        ));
        assert_eq!(h.server.availability(), 0.0);
    }

    #[tokio::test]
    async fn test_lease_gates_requests() {
        let h = harness_with(SetupConfig::new().with_lease(), ConnectionConfig::default()).await;

        let err = h.client.request_response("early".into()).await.unwrap_err();
        assert!(matches!(err, RSocketError::Rejected(_)));
        assert_eq!(h.client.availability(), 0.0);

        h.server
            .lease(Duration::from_secs(30), 1, None)
            .await
            .unwrap();
        while h.client.availability() == 0.0 {
            tokio::task::yield_now().await;
        }

        assert!(h.client.request_response("granted".into()).await.is_ok());
        let err = h.client.request_response("over".into()).await.unwrap_err();
        assert_eq!(err, RSocketError::Rejected("lease exhausted".to_string()));
    }

    #[tokio::test]
    async fn test_lease_requires_negotiation() {
        let h = harness().await;
        let err = h
            .server
            .lease(Duration::from_secs(1), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::InvalidArgument(_)));
        assert_eq!(h.client.availability(), 1.0);
    }

    #[tokio::test]
    async fn test_payload_stream_events() {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        let mut items = PayloadStream::new(7, events_rx, commands);

        {
            let mut next = tokio_test::task::spawn(items.next());
            assert_pending!(next.poll());
            events
                .send(StreamEvent::Next {
                    payload: "x".into(),
                    complete: false,
                })
                .unwrap();
            assert!(next.is_woken());
            let item = assert_ready!(next.poll());
            assert_eq!(item.unwrap().unwrap().data_utf8(), Some("x"));
        }

        items.request(3);
        match commands_rx.try_recv().unwrap() {
            Command::Signal { stream_id, event } => {
                assert_eq!(stream_id, 7);
                assert_eq!(event, StreamEvent::RequestN(3));
            }
            _ => panic!("expected a signal"),
        }

        events.send(StreamEvent::Complete).unwrap();
        assert!(items.next().await.is_none());
        assert!(items.is_done());

        // Finished streams do not cancel on drop
        drop(items);
        assert!(commands_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_stream_drop_cancels() {
        let (_events, events_rx) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        drop(PayloadStream::new(3, events_rx, commands));
        match commands_rx.try_recv().unwrap() {
            Command::Signal { stream_id, event } => {
                assert_eq!(stream_id, 3);
                assert_eq!(event, StreamEvent::Cancel);
            }
            _ => panic!("expected a signal"),
        }
    }
}
