//! Payload fragmentation and reassembly.
//!
//! A request or PAYLOAD frame whose metadata+data exceeds the fragment size
//! is sent as a head frame of the original type followed by PAYLOAD frames.
//! Every fragment except the last carries FOLLOWS; metadata is exhausted
//! before any data is sent; COMPLETE only rides on the last fragment.

use crate::error::ProtocolError;
use crate::frame::{Body, Flags, Frame};
use crate::payload::Payload;
use bytes::BytesMut;
use std::collections::HashMap;

/// Returns whether `frame` must be split to respect `fragment_size`.
///
/// A fragment size of 0 disables fragmentation.
pub fn needs_fragmentation(frame: &Frame, fragment_size: usize) -> bool {
    fragment_size > 0
        && frame.frame_type().can_fragment()
        && frame
            .payload()
            .map_or(false, |payload| payload.len() > fragment_size)
}

/// Splits `frame` into fragments carrying at most `fragment_size` bytes of
/// metadata+data each. Frames that fit are returned unchanged.
pub fn fragment(frame: Frame, fragment_size: usize) -> Vec<Frame> {
    if !needs_fragmentation(&frame, fragment_size) {
        return vec![frame];
    }

    let Frame {
        stream_id,
        flags,
        mut body,
    } = frame;
    let payload = match body.payload_mut() {
        Some(payload) => std::mem::take(payload),
        None => return vec![Frame::new(stream_id, flags, body)],
    };

    let complete = flags.contains(Flags::COMPLETE);
    let next = flags.contains(Flags::NEXT);
    let (mut data, mut metadata) = payload.into_parts();
    let mut head = Some(body);
    let mut fragments = Vec::with_capacity(payload_fragments(&data, &metadata, fragment_size));

    loop {
        let mut budget = fragment_size;
        let chunk_metadata = metadata.take().map(|mut remaining| {
            let n = remaining.len().min(budget);
            budget -= n;
            let chunk = remaining.split_to(n);
            if !remaining.is_empty() {
                metadata = Some(remaining);
            }
            chunk
        });
        let chunk_data = data.split_to(data.len().min(budget));
        let last = metadata.is_none() && data.is_empty();
        let chunk = Payload::new(chunk_data, chunk_metadata);

        let (mut fragment_flags, body) = match head.take() {
            Some(mut body) => {
                if let Some(slot) = body.payload_mut() {
                    *slot = chunk;
                }
                (flags.without(Flags::COMPLETE), body)
            }
            None => {
                let flags = if next { Flags::NEXT } else { Flags::NONE };
                (flags, Body::Payload(chunk))
            }
        };
        fragment_flags.set(Flags::FOLLOWS, !last);
        fragment_flags.set(Flags::COMPLETE, last && complete);
        fragments.push(Frame::new(stream_id, fragment_flags, body));

        if last {
            return fragments;
        }
    }
}

fn payload_fragments(
    data: &bytes::Bytes,
    metadata: &Option<bytes::Bytes>,
    fragment_size: usize,
) -> usize {
    let total = data.len() + metadata.as_ref().map_or(0, |m| m.len());
    total.div_ceil(fragment_size).max(1)
}

/// Default bound on the metadata+data of one reassembled frame (16 MiB).
pub const DEFAULT_MAX_REASSEMBLY_SIZE: usize = 16 * 1024 * 1024;

/// Default bound on all partially reassembled frames of a connection (64 MiB).
pub const DEFAULT_MAX_REASSEMBLY_TOTAL: usize = 64 * 1024 * 1024;

#[derive(Debug)]
struct Partial {
    head: Frame,
    metadata: Option<BytesMut>,
    data: BytesMut,
    fragments: usize,
    size: usize,
}

impl Partial {
    fn start(mut head: Frame) -> Self {
        let payload = head.body.payload_mut().map(std::mem::take).unwrap_or_default();
        let mut partial = Self {
            head,
            metadata: None,
            data: BytesMut::new(),
            fragments: 0,
            size: 0,
        };
        partial.append(payload);
        partial
    }

    fn append(&mut self, payload: Payload) {
        self.size += payload.len();
        let (data, metadata) = payload.into_parts();
        if let Some(metadata) = metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&metadata);
        }
        self.data.extend_from_slice(&data);
        self.fragments += 1;
    }

    fn finish(self, complete: bool) -> Frame {
        let payload = Payload::new(self.data.freeze(), self.metadata.map(BytesMut::freeze));
        let Frame {
            stream_id,
            flags,
            mut body,
        } = self.head;
        if let Some(slot) = body.payload_mut() {
            *slot = payload;
        }
        let mut flags = flags.without(Flags::FOLLOWS);
        if complete {
            flags.insert(Flags::COMPLETE);
        }
        Frame::new(stream_id, flags, body)
    }
}

/// Per-stream reassembly of fragmented frames.
///
/// Buffered bytes are bounded per stream and across all streams; crossing
/// either bound fails the push with [`ProtocolError::ReassemblyLimit`].
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u32, Partial>,
    max_size: usize,
    max_total: usize,
    buffered: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_REASSEMBLY_SIZE, DEFAULT_MAX_REASSEMBLY_TOTAL)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_size` bounds one reassembled frame, `max_total` everything
    /// buffered at once.
    pub fn with_limits(max_size: usize, max_total: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_size,
            max_total,
            buffered: 0,
        }
    }

    /// Feeds one inbound frame.
    ///
    /// Returns `Ok(Some(frame))` when a frame is ready for routing (either an
    /// unfragmented frame passing through or a fully reassembled one) and
    /// `Ok(None)` while more fragments are expected. CANCEL and ERROR for a
    /// stream discard its partial buffer and pass through.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, ProtocolError> {
        let stream_id = frame.stream_id;
        if !frame.frame_type().can_fragment() {
            if matches!(frame.body, Body::Cancel | Body::Error { .. }) {
                self.discard(stream_id);
            }
            return Ok(Some(frame));
        }

        let follows = frame.flags.contains(Flags::FOLLOWS);
        match self.take(stream_id) {
            Some(mut partial) => {
                let complete = frame.flags.contains(Flags::COMPLETE);
                let frame_type = frame.frame_type();
                match frame.body {
                    Body::Payload(payload) => partial.append(payload),
                    _ => {
                        return Err(ProtocolError::UnexpectedFragment {
                            stream_id,
                            frame_type,
                        })
                    }
                }
                if follows {
                    self.hold(stream_id, partial)?;
                    Ok(None)
                } else {
                    self.check_size(stream_id, partial.size)?;
                    Ok(Some(partial.finish(complete)))
                }
            }
            None if follows => {
                self.hold(stream_id, Partial::start(frame))?;
                Ok(None)
            }
            None => Ok(Some(frame)),
        }
    }

    fn take(&mut self, stream_id: u32) -> Option<Partial> {
        let partial = self.partials.remove(&stream_id)?;
        self.buffered -= partial.size;
        Some(partial)
    }

    fn check_size(&self, stream_id: u32, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_size {
            return Err(ProtocolError::ReassemblyLimit {
                stream_id,
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    fn hold(&mut self, stream_id: u32, partial: Partial) -> Result<(), ProtocolError> {
        self.check_size(stream_id, partial.size)?;
        let total = self.buffered + partial.size;
        if total > self.max_total {
            return Err(ProtocolError::ReassemblyLimit {
                stream_id,
                size: total,
                max: self.max_total,
            });
        }
        self.buffered = total;
        self.partials.insert(stream_id, partial);
        Ok(())
    }

    /// Drops any partial frame for `stream_id`. Returns whether one existed.
    pub fn discard(&mut self, stream_id: u32) -> bool {
        self.take(stream_id).is_some()
    }

    pub fn in_progress(&self, stream_id: u32) -> bool {
        self.partials.contains_key(&stream_id)
    }

    /// Number of fragments buffered so far for `stream_id`.
    pub fn buffered_fragments(&self, stream_id: u32) -> usize {
        self.partials.get(&stream_id).map_or(0, |p| p.fragments)
    }

    /// Metadata+data bytes held across all partial frames.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Drops every partial frame (connection teardown).
    pub fn clear(&mut self) {
        self.partials.clear();
        self.buffered = 0;
    }
}
