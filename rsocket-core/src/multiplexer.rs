//! The connection task.
//!
//! One task per connection owns the stream registry, the reassembler, lease
//! and keepalive state. Handles, producers and responder tasks reach it
//! through a command queue; a separate writer task owns the transport sink
//! and writes frames in the order they were queued.

use crate::error::RSocketError;
use crate::lease::LeaseTracker;
use crate::registry::{Side, StreamRegistry};
use crate::responder::{PayloadFlux, Responder};
use crate::resume::ResumeStore;
use crate::socket::{PayloadStream, Pending, PendingSlot, RSocket, Shared};
use crate::stream::{EventSender, Producer, ResponseSender, Stream, StreamEvent, TaskGuard};
use crate::transport::{FrameSink, FrameStream};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rsocket_protocol::{
    fragment, Body, ErrorCode, Flags, Frame, Payload, ProtocolError, Reassembler, MAX_FRAME_LENGTH,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Requests from handles, producers and responder tasks.
pub(crate) enum Command {
    FireAndForget {
        payload: Payload,
        reply: oneshot::Sender<Result<u32, RSocketError>>,
    },
    RequestResponse {
        payload: Payload,
        pending: PendingSlot,
        reply: oneshot::Sender<Result<u32, RSocketError>>,
        response: ResponseSender,
    },
    RequestStream {
        payload: Payload,
        initial_request_n: u32,
        events: EventSender,
        pending: PendingSlot,
        reply: oneshot::Sender<Result<u32, RSocketError>>,
    },
    RequestChannel {
        first: Payload,
        rest: PayloadFlux,
        initial_request_n: u32,
        events: EventSender,
        pending: PendingSlot,
        reply: oneshot::Sender<Result<u32, RSocketError>>,
    },
    MetadataPush {
        metadata: Bytes,
        reply: oneshot::Sender<Result<(), RSocketError>>,
    },
    Lease {
        ttl: Duration,
        request_count: u32,
        metadata: Option<Bytes>,
        reply: oneshot::Sender<Result<(), RSocketError>>,
    },
    /// A local event for an existing stream.
    Signal { stream_id: u32, event: StreamEvent },
    /// The writer task could not write to the transport.
    TransportFailed(RSocketError),
    Close { reply: oneshot::Sender<()> },
}

/// Connection parameters fixed at setup time.
pub(crate) struct Settings {
    pub(crate) side: Side,
    pub(crate) fragment_size: usize,
    pub(crate) max_reassembly_size: usize,
    pub(crate) max_reassembly_total: usize,
    pub(crate) keepalive_interval: Duration,
    pub(crate) max_lifetime: Duration,
    /// Whether this end sends KEEPALIVE(RESPOND) (the client does).
    pub(crate) send_keepalive: bool,
    pub(crate) lease: bool,
    pub(crate) resume: Option<Box<dyn ResumeStore>>,
}

/// Creates the command queue and the requester handle for a new connection.
pub(crate) fn channel(lease: bool) -> (RSocket, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RSocket::new(tx, Arc::new(Shared::new(lease))), rx)
}

/// Spawns the writer and connection tasks. `preamble` frames (SETUP) are
/// written before anything else.
pub(crate) fn spawn(
    settings: Settings,
    socket: &RSocket,
    commands: mpsc::UnboundedReceiver<Command>,
    responder: Arc<dyn Responder>,
    sink: FrameSink,
    inbound: FrameStream,
    preamble: Vec<Frame>,
) {
    let (writer, frames) = mpsc::unbounded_channel();
    for frame in preamble {
        let _ = writer.send(frame);
    }
    tokio::spawn(write_loop(sink, frames, socket.commands().clone()));

    let multiplexer = Multiplexer::new(settings, socket, responder, writer);
    tokio::spawn(multiplexer.run(inbound, commands));
}

async fn write_loop(
    mut sink: FrameSink,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::UnboundedSender<Command>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_batch(&mut sink, frame, &mut frames).await {
            tracing::error!("transport write failed: {}", err);
            let _ = commands.send(Command::TransportFailed(err));
            break;
        }
    }
    let _ = sink.close().await;
}

async fn write_batch(
    sink: &mut FrameSink,
    first: Frame,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<(), RSocketError> {
    sink.feed(first).await?;
    while let Ok(frame) = frames.try_recv() {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

struct Multiplexer {
    side: Side,
    registry: StreamRegistry<Stream>,
    reassembler: Reassembler,
    writer: mpsc::UnboundedSender<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    responder: Arc<dyn Responder>,
    fragment_size: usize,
    keepalive_interval: Duration,
    max_lifetime: Duration,
    send_keepalive: bool,
    last_received: Instant,
    lease_enabled: bool,
    /// Leases we granted the peer (responder side).
    granted: LeaseTracker,
    resume: Option<Box<dyn ResumeStore>>,
    close_requests: Vec<oneshot::Sender<()>>,
}

impl Multiplexer {
    fn new(
        settings: Settings,
        socket: &RSocket,
        responder: Arc<dyn Responder>,
        writer: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            side: settings.side,
            registry: StreamRegistry::new(settings.side),
            reassembler: Reassembler::with_limits(
                settings.max_reassembly_size,
                settings.max_reassembly_total,
            ),
            writer,
            commands: socket.commands().clone(),
            shared: socket.shared().clone(),
            responder,
            fragment_size: settings.fragment_size,
            keepalive_interval: settings.keepalive_interval,
            max_lifetime: settings.max_lifetime,
            send_keepalive: settings.send_keepalive,
            last_received: Instant::now(),
            lease_enabled: settings.lease,
            granted: LeaseTracker::new(),
            resume: settings.resume,
            close_requests: Vec::new(),
        }
    }

    async fn run(mut self, mut inbound: FrameStream, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(
            "{:?} connection started (keepalive {:?}, lifetime {:?}, lease {})",
            self.side,
            self.keepalive_interval,
            self.max_lifetime,
            self.lease_enabled
        );
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(reason) = self.handle_frame(frame) {
                            break reason;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!("inbound transport error: {}", err);
                        if let RSocketError::Protocol(_) = &err {
                            self.send(Frame::error(0, ErrorCode::ConnectionError, err.to_string()));
                        }
                        break err;
                    }
                    None => {
                        tracing::debug!("transport closed by peer");
                        break RSocketError::ConnectionClosed;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(reason) = self.handle_command(command) {
                            break reason;
                        }
                    }
                    None => break RSocketError::ConnectionClosed,
                },
                _ = ticker.tick() => {
                    if let Err(reason) = self.on_keepalive_tick() {
                        break reason;
                    }
                }
            }
        };

        self.terminate(reason);
    }

    fn terminate(&mut self, reason: RSocketError) {
        tracing::info!(
            "{:?} connection closed: {} ({} streams failed)",
            self.side,
            reason,
            self.registry.len()
        );
        self.shared.mark_closed(reason.clone());
        let stream_error = match &reason {
            RSocketError::Connection {
                code: ErrorCode::ConnectionClose,
                ..
            } => RSocketError::ConnectionClosed,
            other => other.clone(),
        };
        for (_, mut stream) in self.registry.drain() {
            stream.fail(stream_error.clone());
        }
        self.reassembler.clear();
        for reply in self.close_requests.drain(..) {
            let _ = reply.send(());
        }
    }

    /// Single exit point for outbound frames.
    fn send(&mut self, frame: Frame) {
        for fragment in fragment(frame, self.fragment_size) {
            if let Some(store) = self.resume.as_mut() {
                store.buffer_sent(&fragment);
            }
            tracing::trace!("send {}", fragment);
            if self.writer.send(fragment).is_err() {
                tracing::debug!("writer gone, dropping frame");
            }
        }
    }

    /// Sends ERROR(CONNECTION_ERROR) and returns the matching close reason.
    fn connection_error(&mut self, message: String) -> RSocketError {
        tracing::warn!("connection error: {}", message);
        self.send(Frame::error(0, ErrorCode::ConnectionError, message.clone()));
        RSocketError::Connection {
            code: ErrorCode::ConnectionError,
            message,
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), RSocketError> {
        tracing::trace!("recv {}", frame);
        self.last_received = Instant::now();
        if let Some(store) = self.resume.as_mut() {
            store.received(&frame);
        }

        if frame.stream_id == 0 {
            return self.handle_connection_frame(frame);
        }

        let stream_id = frame.stream_id;
        if frame.is_request() && frame.flags.contains(Flags::FOLLOWS) && !self.admit_request(&frame)? {
            return Ok(());
        }
        let reassembling = self.reassembler.in_progress(stream_id);
        if !frame.is_request() && !reassembling && !self.registry.contains(stream_id) {
            return self.handle_orphan(frame);
        }

        let frame = match self.reassembler.push(frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err @ ProtocolError::ReassemblyLimit { .. }) => {
                return Err(self.connection_error(err.to_string()));
            }
            Err(err) => {
                if self.registry.contains(stream_id) {
                    self.fail_stream(stream_id, err.to_string());
                    return Ok(());
                }
                return Err(self.connection_error(err.to_string()));
            }
        };

        if frame.is_request() {
            return self.handle_request(frame);
        }

        let outcome = match self.registry.get_mut(stream_id) {
            Some(stream) => stream.on_frame(frame),
            None if reassembling => {
                if !self.reassembler.in_progress(stream_id) {
                    tracing::debug!(
                        "stream {}: fragmented request abandoned with {}",
                        stream_id,
                        frame.frame_type()
                    );
                    self.registry.observe(stream_id);
                }
                return Ok(());
            }
            None => return self.handle_orphan(frame),
        };
        match outcome {
            Ok(frames) => {
                for frame in frames {
                    self.send(frame);
                }
                self.reap(stream_id);
            }
            Err(reason) => self.fail_stream(stream_id, reason),
        }
        Ok(())
    }

    fn handle_connection_frame(&mut self, frame: Frame) -> Result<(), RSocketError> {
        let flags = frame.flags;
        match frame.body {
            Body::Keepalive(keepalive) => {
                if let Some(store) = self.resume.as_mut() {
                    store.release(keepalive.last_received_position);
                }
                if flags.contains(Flags::RESPOND) {
                    let position = self.implied_position();
                    self.send(Frame::keepalive(position, keepalive.data, false));
                }
                Ok(())
            }
            Body::Lease(lease) => {
                if !self.lease_enabled {
                    tracing::warn!("ignoring LEASE, leasing was not negotiated");
                    return Ok(());
                }
                tracing::debug!(
                    "lease received: {} requests for {}ms",
                    lease.request_count,
                    lease.ttl_ms
                );
                self.shared.lease.lock().grant(
                    Duration::from_millis(u64::from(lease.ttl_ms)),
                    lease.request_count,
                );
                Ok(())
            }
            Body::Error { code, message } => {
                tracing::warn!("peer closed connection: {} - {}", code, message);
                Err(RSocketError::Connection { code, message })
            }
            Body::MetadataPush(metadata) => {
                tokio::spawn(self.responder.metadata_push(metadata));
                Ok(())
            }
            Body::Ext { .. } if flags.contains(Flags::IGNORE) => {
                tracing::debug!("ignoring connection-level EXT frame");
                Ok(())
            }
            other => Err(self.connection_error(format!(
                "unexpected {} frame on stream 0",
                other.frame_type()
            ))),
        }
    }

    /// Checks the id of a request opened by the peer. `Ok(false)` drops the
    /// request; a wrong-parity id ends the connection.
    fn admit_request(&mut self, frame: &Frame) -> Result<bool, RSocketError> {
        let stream_id = frame.stream_id;
        if !self.registry.is_peer_id(stream_id) {
            return Err(self.connection_error(format!(
                "peer opened stream {} with our id parity",
                stream_id
            )));
        }
        if self.registry.contains(stream_id) {
            self.fail_stream(stream_id, "stream id already in use".to_string());
            return Ok(false);
        }
        if self.registry.is_retired(stream_id) {
            tracing::warn!("ignoring {} for retired stream {}", frame.frame_type(), stream_id);
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_request(&mut self, frame: Frame) -> Result<(), RSocketError> {
        let stream_id = frame.stream_id;
        if !self.admit_request(&frame)? {
            return Ok(());
        }
        self.registry.observe(stream_id);

        if self.lease_enabled {
            if let Err(err) = self.granted.try_acquire() {
                tracing::debug!("stream {}: rejecting request: {}", stream_id, err);
                if !matches!(frame.body, Body::RequestFnf(_)) {
                    self.send(Frame::error(stream_id, ErrorCode::Rejected, err.message()));
                }
                return Ok(());
            }
        }

        let complete = frame.flags.contains(Flags::COMPLETE);
        match frame.body {
            Body::RequestFnf(payload) => {
                tracing::debug!("stream {}: fire-and-forget", stream_id);
                tokio::spawn(self.responder.fire_and_forget(payload));
            }
            Body::RequestResponse(payload) => {
                tracing::debug!("stream {}: request-response", stream_id);
                let response = self.responder.request_response(payload);
                let commands = self.commands.clone();
                let task = tokio::spawn(async move {
                    let event = match response.await {
                        Ok(Some(payload)) => StreamEvent::Next {
                            payload,
                            complete: true,
                        },
                        Ok(None) => StreamEvent::Complete,
                        Err(err) => StreamEvent::Error(err),
                    };
                    let _ = commands.send(Command::Signal { stream_id, event });
                });
                let stream = Stream::responder_response(stream_id, TaskGuard::new(task.abort_handle()));
                self.register(stream_id, stream);
            }
            Body::RequestStream {
                initial_request_n,
                payload,
            } => {
                tracing::debug!(
                    "stream {}: request-stream (n={})",
                    stream_id,
                    initial_request_n
                );
                let items = self.responder.request_stream(payload);
                let producer =
                    Producer::spawn(stream_id, items, initial_request_n, self.commands.clone());
                let stream = Stream::responder_stream(stream_id, initial_request_n, producer);
                self.register(stream_id, stream);
            }
            Body::RequestChannel {
                initial_request_n,
                payload,
            } => {
                tracing::debug!(
                    "stream {}: request-channel (n={}, complete={})",
                    stream_id,
                    initial_request_n,
                    complete
                );
                let (events, events_rx) = mpsc::unbounded_channel();
                if complete {
                    let _ = events.send(StreamEvent::Complete);
                }
                let inbound = PayloadStream::new(stream_id, events_rx, self.commands.clone());
                let items = self.responder.request_channel(payload, inbound);
                let producer =
                    Producer::spawn(stream_id, items, initial_request_n, self.commands.clone());
                let stream = Stream::responder_channel(
                    stream_id,
                    initial_request_n,
                    events,
                    producer,
                    complete,
                );
                self.register(stream_id, stream);
            }
            _ => {}
        }
        Ok(())
    }

    fn register(&mut self, stream_id: u32, stream: Stream) {
        if let Err(err) = self.registry.register(stream_id, stream) {
            tracing::warn!("stream {}: {}", stream_id, err);
        }
    }

    fn handle_orphan(&mut self, frame: Frame) -> Result<(), RSocketError> {
        let stream_id = frame.stream_id;
        if self.registry.is_retired(stream_id) {
            tracing::debug!("ignoring {} for closed stream {}", frame.frame_type(), stream_id);
            return Ok(());
        }
        if frame.flags.contains(Flags::IGNORE) {
            tracing::debug!("ignoring {} for unknown stream {}", frame.frame_type(), stream_id);
            return Ok(());
        }
        Err(self.connection_error(format!(
            "{} for unknown stream {}",
            frame.frame_type(),
            stream_id
        )))
    }

    /// Tears a stream down after a violation by the peer.
    fn fail_stream(&mut self, stream_id: u32, reason: String) {
        tracing::warn!("stream {}: protocol violation: {}", stream_id, reason);
        self.reassembler.discard(stream_id);
        if let Some(mut stream) = self.registry.remove(stream_id) {
            let frame = stream.violate(reason);
            self.send(frame);
        }
    }

    fn reap(&mut self, stream_id: u32) {
        let terminal = self
            .registry
            .get(stream_id)
            .map_or(false, Stream::is_terminal);
        if terminal {
            if let Some(stream) = self.registry.remove(stream_id) {
                tracing::debug!(
                    "stream {}: {:?} {:?} finished as {:?}",
                    stream.id(),
                    stream.role(),
                    stream.interaction(),
                    stream.state()
                );
            }
            self.reassembler.discard(stream_id);
        }
    }

    fn implied_position(&self) -> u64 {
        self.resume.as_ref().map_or(0, |store| store.implied_position())
    }

    fn on_keepalive_tick(&mut self) -> Result<(), RSocketError> {
        let silent = self.last_received.elapsed();
        if silent > self.max_lifetime {
            return Err(self.connection_error(format!(
                "no frame received for {}ms (max lifetime {}ms)",
                silent.as_millis(),
                self.max_lifetime.as_millis()
            )));
        }
        if self.send_keepalive {
            let position = self.implied_position();
            self.send(Frame::keepalive(position, Bytes::new(), true));
        }
        Ok(())
    }

    fn check_lease(&self) -> Result<(), RSocketError> {
        if self.lease_enabled {
            self.shared.lease.lock().try_acquire()
        } else {
            Ok(())
        }
    }

    /// Turns an item too large to send into an error on its own stream.
    fn check_signal(&self, stream_id: u32, event: StreamEvent) -> StreamEvent {
        let size_check = match &event {
            StreamEvent::Next { payload, .. } => {
                self.check_frame_size(&Frame::payload_next(stream_id, payload.clone(), false))
            }
            StreamEvent::Extension {
                extended_type,
                payload,
            } => self.check_frame_size(&Frame::ext(stream_id, *extended_type, payload.clone(), false)),
            _ => Ok(()),
        };
        match size_check {
            Ok(()) => event,
            Err(err) => {
                tracing::warn!("stream {}: {}", stream_id, err);
                StreamEvent::Error(err)
            }
        }
    }

    /// Frames that cannot be fragmented must fit the 24-bit length field.
    fn check_frame_size(&self, frame: &Frame) -> Result<(), RSocketError> {
        if self.fragment_size > 0 && frame.frame_type().can_fragment() {
            return Ok(());
        }
        let size = frame.encoded_len();
        if size > MAX_FRAME_LENGTH {
            return Err(RSocketError::InvalidArgument(format!(
                "frame of {} bytes exceeds the {} byte limit and fragmentation is off",
                size, MAX_FRAME_LENGTH
            )));
        }
        Ok(())
    }

    /// Allocates a stream id for a new local request. Exhaustion is fatal.
    fn allocate(&mut self, request: &Frame) -> Result<u32, RSocketError> {
        self.check_frame_size(request)?;
        self.check_lease()?;
        self.registry.allocate()
    }

    /// Like [`Self::allocate`], but opens nothing once the caller has gone
    /// away. The slot stays locked until the id is recorded in it.
    fn open_stream(
        &mut self,
        request: &mut Frame,
        pending: &PendingSlot,
    ) -> Result<Option<u32>, RSocketError> {
        let mut pending = pending.lock();
        if *pending == Pending::Abandoned {
            tracing::trace!("dropping {} abandoned by its caller", request.frame_type());
            return Ok(None);
        }
        let stream_id = self.allocate(request)?;
        request.stream_id = stream_id;
        *pending = Pending::Open(stream_id);
        Ok(Some(stream_id))
    }

    /// Returns `Some(reason)` when the command ends the connection.
    fn handle_command(&mut self, command: Command) -> Option<RSocketError> {
        match command {
            Command::FireAndForget { payload, reply } => {
                let mut request = Frame::request_fnf(0, payload);
                request.stream_id = match self.allocate(&request) {
                    Ok(id) => id,
                    Err(err) => return reject(reply, err),
                };
                let stream_id = request.stream_id;
                self.send(request);
                let _ = reply.send(Ok(stream_id));
            }
            Command::RequestResponse {
                payload,
                pending,
                reply,
                response,
            } => {
                let mut request = Frame::request_response(0, payload);
                let stream_id = match self.open_stream(&mut request, &pending) {
                    Ok(Some(id)) => id,
                    Ok(None) => return None,
                    Err(err) => return reject(reply, err),
                };
                self.register(stream_id, Stream::requester_response(stream_id, response));
                self.send(request);
                let _ = reply.send(Ok(stream_id));
            }
            Command::RequestStream {
                payload,
                initial_request_n,
                events,
                pending,
                reply,
            } => {
                let mut request = Frame::request_stream(0, initial_request_n, payload);
                let stream_id = match self.open_stream(&mut request, &pending) {
                    Ok(Some(id)) => id,
                    Ok(None) => return None,
                    Err(err) => return reject(reply, err),
                };
                let stream = Stream::requester_stream(stream_id, initial_request_n, events);
                self.register(stream_id, stream);
                self.send(request);
                let _ = reply.send(Ok(stream_id));
            }
            Command::RequestChannel {
                first,
                rest,
                initial_request_n,
                events,
                pending,
                reply,
            } => {
                let mut request = Frame::request_channel(0, initial_request_n, first, false);
                let stream_id = match self.open_stream(&mut request, &pending) {
                    Ok(Some(id)) => id,
                    Ok(None) => return None,
                    Err(err) => return reject(reply, err),
                };
                let producer = Producer::spawn(stream_id, rest, 0, self.commands.clone());
                let stream =
                    Stream::requester_channel(stream_id, initial_request_n, events, producer);
                self.register(stream_id, stream);
                self.send(request);
                let _ = reply.send(Ok(stream_id));
            }
            Command::MetadataPush { metadata, reply } => {
                let frame = Frame::metadata_push(metadata);
                if let Err(err) = self.check_frame_size(&frame) {
                    return reject(reply, err);
                }
                self.send(frame);
                let _ = reply.send(Ok(()));
            }
            Command::Lease {
                ttl,
                request_count,
                metadata,
                reply,
            } => {
                if !self.lease_enabled {
                    let _ = reply.send(Err(RSocketError::InvalidArgument(
                        "leasing was not negotiated".to_string(),
                    )));
                    return None;
                }
                let ttl_ms = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
                self.granted.grant(ttl, request_count);
                self.send(Frame::lease(ttl_ms, request_count, metadata));
                let _ = reply.send(Ok(()));
            }
            Command::Signal { stream_id, event } => {
                let event = self.check_signal(stream_id, event);
                let frames = match self.registry.get_mut(stream_id) {
                    Some(stream) => stream.on_signal(event),
                    None => {
                        tracing::trace!("stream {}: signal after close", stream_id);
                        return None;
                    }
                };
                for frame in frames {
                    self.send(frame);
                }
                self.reap(stream_id);
            }
            Command::TransportFailed(err) => return Some(err),
            Command::Close { reply } => {
                self.close_requests.push(reply);
                self.send(Frame::error(0, ErrorCode::ConnectionClose, "connection closed"));
                return Some(RSocketError::ConnectionClosed);
            }
        }
        None
    }
}

/// Fails a request command. Id exhaustion also ends the connection.
fn reject<T>(
    reply: oneshot::Sender<Result<T, RSocketError>>,
    err: RSocketError,
) -> Option<RSocketError> {
    let fatal = matches!(err, RSocketError::StreamIdsExhausted);
    let _ = reply.send(Err(err.clone()));
    fatal.then_some(err)
}
