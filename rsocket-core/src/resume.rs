//! Resumption bookkeeping.
//!
//! Positions count encoded bytes of resumable frames (requests, REQUEST_N,
//! CANCEL, ERROR on a stream, PAYLOAD). The sender keeps what it wrote until
//! the peer acknowledges it through the KEEPALIVE position, so the session
//! could be replayed onto a new transport.

use crate::error::RSocketError;
use rsocket_protocol::{Frame, FrameType};
use std::collections::VecDeque;

/// Default bound on buffered, unacknowledged frame bytes (1 MiB).
pub const DEFAULT_RESUME_BUFFER: usize = 1024 * 1024;

/// Returns whether `frame` takes part in resume positions.
pub fn is_resumable(frame: &Frame) -> bool {
    match frame.frame_type() {
        FrameType::RequestResponse
        | FrameType::RequestFnf
        | FrameType::RequestStream
        | FrameType::RequestChannel
        | FrameType::RequestN
        | FrameType::Cancel
        | FrameType::Payload => true,
        FrameType::Error => frame.stream_id != 0,
        _ => false,
    }
}

/// Storage for sent frames awaiting acknowledgement.
pub trait ResumeStore: Send {
    /// Records a frame we sent.
    fn buffer_sent(&mut self, frame: &Frame);

    /// Records a frame we received.
    fn received(&mut self, frame: &Frame);

    /// Bytes of resumable frames received so far.
    fn implied_position(&self) -> u64;

    /// Position of the oldest frame still available for replay.
    fn first_available_position(&self) -> u64;

    /// Drops frames the peer has acknowledged up to `position`.
    fn release(&mut self, position: u64);

    /// Returns the frames sent at or after `position`.
    fn replay_from(&self, position: u64) -> Result<Vec<Frame>, RSocketError>;
}

/// Bounded in-memory [`ResumeStore`].
///
/// When the buffer exceeds its capacity the oldest frames are evicted and
/// replay from before them becomes impossible.
#[derive(Debug)]
pub struct InMemoryResumeStore {
    frames: VecDeque<(u64, Frame)>,
    first_position: u64,
    sent_position: u64,
    received_position: u64,
    buffered_bytes: usize,
    capacity: usize,
}

impl InMemoryResumeStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            first_position: 0,
            sent_position: 0,
            received_position: 0,
            buffered_bytes: 0,
            capacity,
        }
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn sent_position(&self) -> u64 {
        self.sent_position
    }

    fn pop_front(&mut self) {
        if let Some((position, frame)) = self.frames.pop_front() {
            let len = frame.encoded_len();
            self.buffered_bytes -= len;
            self.first_position = position + len as u64;
        }
    }
}

impl Default for InMemoryResumeStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESUME_BUFFER)
    }
}

impl ResumeStore for InMemoryResumeStore {
    fn buffer_sent(&mut self, frame: &Frame) {
        if !is_resumable(frame) {
            return;
        }
        let len = frame.encoded_len();
        self.frames.push_back((self.sent_position, frame.clone()));
        self.sent_position += len as u64;
        self.buffered_bytes += len;
        while self.buffered_bytes > self.capacity {
            self.pop_front();
        }
    }

    fn received(&mut self, frame: &Frame) {
        if is_resumable(frame) {
            self.received_position += frame.encoded_len() as u64;
        }
    }

    fn implied_position(&self) -> u64 {
        self.received_position
    }

    fn first_available_position(&self) -> u64 {
        self.first_position
    }

    fn release(&mut self, position: u64) {
        while let Some((start, frame)) = self.frames.front() {
            if start + frame.encoded_len() as u64 > position {
                break;
            }
            self.pop_front();
        }
    }

    fn replay_from(&self, position: u64) -> Result<Vec<Frame>, RSocketError> {
        if position < self.first_position || position > self.sent_position {
            return Err(RSocketError::Rejected(format!(
                "position {} outside buffered range {}..{}",
                position, self.first_position, self.sent_position
            )));
        }
        Ok(self
            .frames
            .iter()
            .filter(|(start, _)| *start >= position)
            .map(|(_, frame)| frame.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rsocket_protocol::Payload;

    fn payload_frame(id: u32) -> Frame {
        // 6 byte header + 4 bytes data
        Frame::payload_next(id, Payload::from_data("data"), false)
    }

    #[test]
    fn test_only_resumable_frames_count() {
        let mut store = InMemoryResumeStore::default();
        store.buffer_sent(&Frame::keepalive(0, Bytes::new(), true));
        store.buffer_sent(&Frame::error(0, rsocket_protocol::ErrorCode::ConnectionClose, ""));
        assert_eq!(store.sent_position(), 0);

        store.buffer_sent(&payload_frame(1));
        assert_eq!(store.sent_position(), 10);
        assert_eq!(store.buffered_frames(), 1);

        store.received(&Frame::request_n(1, 5));
        store.received(&Frame::lease(1000, 1, None));
        assert_eq!(store.implied_position(), 10);
    }

    #[test]
    fn test_release_acknowledged_frames() {
        let mut store = InMemoryResumeStore::default();
        for id in [1, 3, 5] {
            store.buffer_sent(&payload_frame(id));
        }
        store.release(15);
        // first frame fully acknowledged, second only partially
        assert_eq!(store.buffered_frames(), 2);
        assert_eq!(store.first_available_position(), 10);

        store.release(30);
        assert_eq!(store.buffered_frames(), 0);
        assert_eq!(store.buffered_bytes(), 0);
    }

    #[test]
    fn test_replay_from_position() {
        let mut store = InMemoryResumeStore::default();
        for id in [1, 3, 5] {
            store.buffer_sent(&payload_frame(id));
        }
        let replay = store.replay_from(10).unwrap();
        assert_eq!(replay, vec![payload_frame(3), payload_frame(5)]);
        assert!(store.replay_from(31).is_err());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut store = InMemoryResumeStore::new(25);
        for id in [1, 3, 5] {
            store.buffer_sent(&payload_frame(id));
        }
        assert_eq!(store.buffered_frames(), 2);
        assert_eq!(store.first_available_position(), 10);
        assert!(store.replay_from(0).is_err());
    }
}
