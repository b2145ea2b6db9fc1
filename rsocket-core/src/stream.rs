//! Per-stream state machines.
//!
//! A [`Stream`] is owned by the connection task. It reacts to inbound frames
//! ([`Stream::on_frame`]) and to local signals from handles and producers
//! ([`Stream::on_signal`]), returning the frames to send. Terminal streams
//! are removed from the registry by the caller.

use crate::error::RSocketError;
use crate::flow::{self, Credit};
use crate::multiplexer::Command;
use futures::stream::{BoxStream, StreamExt};
use rsocket_protocol::{Body, ErrorCode, Flags, Frame, Payload};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::AbortHandle;

/// Events delivered to stream consumers, and signals sent by local handles
/// and producers to the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An item; `complete` marks it as the last one.
    Next { payload: Payload, complete: bool },
    Complete,
    Error(RSocketError),
    RequestN(u32),
    Cancel,
    Extension { extended_type: u32, payload: Payload },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request-response awaiting its answer.
    Requested,
    Active,
    /// Channel whose local half has completed.
    HalfClosedLocal,
    /// Channel whose remote half has completed.
    HalfClosedRemote,
    Completed,
    Errored,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Errored | StreamState::Cancelled
        )
    }
}

pub(crate) type ResponseSender = oneshot::Sender<Result<Option<Payload>, RSocketError>>;
pub(crate) type EventSender = mpsc::UnboundedSender<StreamEvent>;

/// Where inbound items for the local consumer go.
enum Sink {
    None,
    Response(Option<ResponseSender>),
    Events(EventSender),
}

impl Sink {
    fn next(&mut self, payload: Payload, complete: bool) {
        match self {
            Sink::Response(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Ok(Some(payload)));
                }
            }
            Sink::Events(tx) => {
                let _ = tx.send(StreamEvent::Next { payload, complete });
            }
            Sink::None => {}
        }
    }

    fn complete(&mut self) {
        match self {
            Sink::Response(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Ok(None));
                }
            }
            Sink::Events(tx) => {
                let _ = tx.send(StreamEvent::Complete);
            }
            Sink::None => {}
        }
    }

    fn error(&mut self, err: RSocketError) {
        match self {
            Sink::Response(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
            Sink::Events(tx) => {
                let _ = tx.send(StreamEvent::Error(err));
            }
            Sink::None => {}
        }
        *self = Sink::None;
    }

    fn extension(&mut self, extended_type: u32, payload: Payload) -> bool {
        match self {
            Sink::Events(tx) => tx
                .send(StreamEvent::Extension {
                    extended_type,
                    payload,
                })
                .is_ok(),
            _ => false,
        }
    }
}

/// Drives a local outbound item stream, pulling the next item only after
/// the peer has granted credit for the one before it.
pub(crate) struct Producer {
    credit: Arc<Semaphore>,
    task: AbortHandle,
}

impl Producer {
    pub(crate) fn spawn(
        stream_id: u32,
        items: BoxStream<'static, Result<Payload, RSocketError>>,
        initial_request_n: u32,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let credit = Arc::new(Semaphore::new(flow::permits(initial_request_n)));
        let task = tokio::spawn(drive(stream_id, items, credit.clone(), commands));
        Self {
            credit,
            task: task.abort_handle(),
        }
    }

    fn grant(&self, n: u32) {
        flow::add_permits(&self.credit, n);
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.credit.close();
        self.task.abort();
    }
}

async fn drive(
    stream_id: u32,
    mut items: BoxStream<'static, Result<Payload, RSocketError>>,
    credit: Arc<Semaphore>,
    commands: mpsc::UnboundedSender<Command>,
) {
    // At most one item is pulled ahead of credit, so completion can be
    // signalled without demand.
    while let Some(item) = items.next().await {
        let event = match item {
            Ok(payload) => {
                match credit.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }
                StreamEvent::Next {
                    payload,
                    complete: false,
                }
            }
            Err(err) => {
                let _ = commands.send(Command::Signal {
                    stream_id,
                    event: StreamEvent::Error(err),
                });
                return;
            }
        };
        if commands.send(Command::Signal { stream_id, event }).is_err() {
            return;
        }
    }
    let _ = commands.send(Command::Signal {
        stream_id,
        event: StreamEvent::Complete,
    });
}

/// Aborts a responder task when the stream goes away.
pub(crate) struct TaskGuard(AbortHandle);

impl TaskGuard {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct Stream {
    id: u32,
    interaction: Interaction,
    role: Role,
    state: StreamState,
    local_done: bool,
    remote_done: bool,
    /// Items we have asked the peer for and not yet received.
    inbound: Credit,
    /// Items the peer has asked us for and we have not yet sent.
    outbound: Credit,
    sink: Sink,
    producer: Option<Producer>,
    task: Option<TaskGuard>,
    backlog: VecDeque<Payload>,
    complete_after_backlog: bool,
}

impl Stream {
    fn new(id: u32, interaction: Interaction, role: Role, sink: Sink) -> Self {
        let state = if interaction == Interaction::RequestResponse {
            StreamState::Requested
        } else {
            StreamState::Active
        };
        Self {
            id,
            interaction,
            role,
            state,
            local_done: false,
            remote_done: false,
            inbound: Credit::default(),
            outbound: Credit::default(),
            sink,
            producer: None,
            task: None,
            backlog: VecDeque::new(),
            complete_after_backlog: false,
        }
    }

    pub(crate) fn requester_response(id: u32, response: ResponseSender) -> Self {
        let mut stream = Self::new(
            id,
            Interaction::RequestResponse,
            Role::Requester,
            Sink::Response(Some(response)),
        );
        stream.local_done = true;
        stream
    }

    pub(crate) fn requester_stream(id: u32, initial_request_n: u32, events: EventSender) -> Self {
        let mut stream = Self::new(
            id,
            Interaction::RequestStream,
            Role::Requester,
            Sink::Events(events),
        );
        stream.local_done = true;
        stream.inbound = Credit::new(initial_request_n);
        stream
    }

    pub(crate) fn requester_channel(
        id: u32,
        initial_request_n: u32,
        events: EventSender,
        producer: Producer,
    ) -> Self {
        let mut stream = Self::new(
            id,
            Interaction::RequestChannel,
            Role::Requester,
            Sink::Events(events),
        );
        stream.inbound = Credit::new(initial_request_n);
        stream.producer = Some(producer);
        stream
    }

    pub(crate) fn responder_response(id: u32, task: TaskGuard) -> Self {
        let mut stream = Self::new(id, Interaction::RequestResponse, Role::Responder, Sink::None);
        stream.remote_done = true;
        stream.state = StreamState::Active;
        stream.task = Some(task);
        stream
    }

    pub(crate) fn responder_stream(id: u32, initial_request_n: u32, producer: Producer) -> Self {
        let mut stream = Self::new(id, Interaction::RequestStream, Role::Responder, Sink::None);
        stream.remote_done = true;
        stream.outbound = Credit::new(initial_request_n);
        stream.producer = Some(producer);
        stream
    }

    pub(crate) fn responder_channel(
        id: u32,
        initial_request_n: u32,
        events: EventSender,
        producer: Producer,
        remote_done: bool,
    ) -> Self {
        let mut stream = Self::new(
            id,
            Interaction::RequestChannel,
            Role::Responder,
            Sink::Events(events),
        );
        stream.outbound = Credit::new(initial_request_n);
        stream.producer = Some(producer);
        stream.remote_done = remote_done;
        stream.refresh_state();
        stream
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn interaction(&self) -> Interaction {
        self.interaction
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Handles a frame from the peer. `Err` carries a violation reason; the
    /// caller tears the stream down with [`Stream::violate`].
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<Vec<Frame>, String> {
        if self.is_terminal() {
            return Ok(Vec::new());
        }
        let flags = frame.flags;
        match frame.body {
            Body::Payload(payload) => self.on_payload(payload, flags),
            Body::RequestN { n } => Ok(self.on_request_n(n)),
            Body::Cancel => {
                self.state = StreamState::Cancelled;
                self.release();
                self.sink.error(RSocketError::Cancelled);
                Ok(Vec::new())
            }
            Body::Error { code, message } => {
                self.state = StreamState::Errored;
                self.release();
                self.sink.error(RSocketError::Application { code, message });
                Ok(Vec::new())
            }
            Body::Ext {
                extended_type,
                payload,
            } => {
                if !self.sink.extension(extended_type, payload) {
                    tracing::debug!(
                        "stream {}: dropping extension frame {:#x}",
                        self.id,
                        extended_type
                    );
                }
                Ok(Vec::new())
            }
            other => Err(format!(
                "unexpected {} frame on a live stream",
                other.frame_type()
            )),
        }
    }

    fn on_payload(&mut self, payload: Payload, flags: Flags) -> Result<Vec<Frame>, String> {
        if self.remote_done {
            return Err("PAYLOAD after the peer completed".to_string());
        }
        let next = flags.contains(Flags::NEXT);
        let complete = flags.contains(Flags::COMPLETE);
        if !next && !complete {
            return Err("PAYLOAD without NEXT or COMPLETE".to_string());
        }

        if self.interaction == Interaction::RequestResponse {
            self.remote_done = true;
            if next {
                self.sink.next(payload, true);
            } else {
                self.sink.complete();
            }
            self.refresh_state();
            return Ok(Vec::new());
        }

        if next {
            if self.inbound.consume().is_err() {
                return Err("received more items than requested".to_string());
            }
            self.sink.next(payload, complete);
        }
        if complete {
            self.remote_done = true;
            if !next {
                self.sink.complete();
            }
        }
        self.refresh_state();
        Ok(Vec::new())
    }

    fn on_request_n(&mut self, n: u32) -> Vec<Frame> {
        match &self.producer {
            Some(producer) if !self.local_done => {
                self.outbound.grant(n);
                producer.grant(n);
                self.flush_backlog()
            }
            _ => {
                tracing::debug!("stream {}: ignoring REQUEST_N({}) with nothing to send", self.id, n);
                Vec::new()
            }
        }
    }

    /// Handles a signal from a local handle, producer or responder task.
    pub(crate) fn on_signal(&mut self, event: StreamEvent) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        match event {
            StreamEvent::Next { payload, complete } => self.emit_next(payload, complete),
            StreamEvent::Complete => self.emit_complete(),
            StreamEvent::Error(err) => {
                self.state = StreamState::Errored;
                self.release();
                let frame = Frame::error(self.id, err.stream_error_code(), err.message());
                self.sink.error(err);
                vec![frame]
            }
            StreamEvent::RequestN(n) => {
                if self.remote_done || n == 0 {
                    return Vec::new();
                }
                self.inbound.grant(n);
                vec![Frame::request_n(self.id, n)]
            }
            StreamEvent::Cancel => {
                self.state = StreamState::Cancelled;
                self.release();
                self.sink = Sink::None;
                vec![Frame::cancel(self.id)]
            }
            StreamEvent::Extension {
                extended_type,
                payload,
            } => vec![Frame::ext(self.id, extended_type, payload, false)],
        }
    }

    fn emit_next(&mut self, payload: Payload, complete: bool) -> Vec<Frame> {
        if self.local_done {
            return Vec::new();
        }
        if self.interaction == Interaction::RequestResponse {
            self.local_done = true;
            self.refresh_state();
            return vec![Frame::payload_next(self.id, payload, true)];
        }
        if !self.backlog.is_empty() || self.outbound.consume().is_err() {
            self.backlog.push_back(payload);
            self.complete_after_backlog |= complete;
            return Vec::new();
        }
        if complete {
            self.finish_local();
        }
        vec![Frame::payload_next(self.id, payload, complete)]
    }

    fn emit_complete(&mut self) -> Vec<Frame> {
        if self.local_done {
            return Vec::new();
        }
        if !self.backlog.is_empty() {
            self.complete_after_backlog = true;
            return Vec::new();
        }
        self.finish_local();
        vec![Frame::payload_complete(self.id)]
    }

    fn flush_backlog(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !self.backlog.is_empty() && self.outbound.consume().is_ok() {
            if let Some(payload) = self.backlog.pop_front() {
                let last = self.backlog.is_empty() && self.complete_after_backlog;
                if last {
                    self.finish_local();
                }
                frames.push(Frame::payload_next(self.id, payload, last));
            }
        }
        frames
    }

    fn finish_local(&mut self) {
        self.local_done = true;
        self.producer = None;
        self.refresh_state();
    }

    fn release(&mut self) {
        self.producer = None;
        self.task = None;
        self.backlog.clear();
    }

    fn refresh_state(&mut self) {
        if self.is_terminal() {
            return;
        }
        let channel = self.interaction == Interaction::RequestChannel;
        self.state = match (self.local_done, self.remote_done) {
            (true, true) => StreamState::Completed,
            (true, false) if channel => StreamState::HalfClosedLocal,
            (false, true) if channel => StreamState::HalfClosedRemote,
            _ if self.interaction == Interaction::RequestResponse => StreamState::Requested,
            _ => StreamState::Active,
        };
        if self.state == StreamState::Completed {
            self.release();
        }
    }

    /// Fails the stream with a local violation and returns the frame that
    /// tells the peer: CANCEL from the requester, ERROR(INVALID) from the
    /// responder.
    pub(crate) fn violate(&mut self, reason: String) -> Frame {
        let frame = match self.role {
            Role::Requester => Frame::cancel(self.id),
            Role::Responder => Frame::error(self.id, ErrorCode::Invalid, reason.clone()),
        };
        self.fail(RSocketError::ProtocolViolation {
            stream_id: self.id,
            reason,
        });
        frame
    }

    /// Fails the stream locally without telling the peer (teardown).
    pub(crate) fn fail(&mut self, err: RSocketError) {
        self.state = StreamState::Errored;
        self.release();
        self.sink.error(err);
    }
}
