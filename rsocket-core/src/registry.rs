//! Stream id allocation and the live stream table.

use crate::error::RSocketError;
use rsocket_protocol::MAX_STREAM_ID;
use std::collections::HashMap;

/// Which end of the connection we are. Clients allocate odd stream ids,
/// servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn first_id(self) -> u32 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }
}

/// Live streams keyed by id, plus enough history to tell a retired id from
/// one that was never used.
#[derive(Debug)]
pub struct StreamRegistry<S> {
    side: Side,
    streams: HashMap<u32, S>,
    next_local: u32,
    exhausted: bool,
    highest_peer: u32,
}

impl<S> StreamRegistry<S> {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            streams: HashMap::new(),
            next_local: side.first_id(),
            exhausted: false,
            highest_peer: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Returns the next unused id of the local parity. Ids are never reused;
    /// running out is fatal for the connection.
    pub fn allocate(&mut self) -> Result<u32, RSocketError> {
        if self.exhausted {
            return Err(RSocketError::StreamIdsExhausted);
        }
        let id = self.next_local;
        match id.checked_add(2) {
            Some(next) if next <= MAX_STREAM_ID => self.next_local = next,
            _ => self.exhausted = true,
        }
        Ok(id)
    }

    /// Inserts a stream. Fails if the id is already live.
    pub fn register(&mut self, stream_id: u32, stream: S) -> Result<(), RSocketError> {
        if self.streams.contains_key(&stream_id) {
            return Err(RSocketError::ProtocolViolation {
                stream_id,
                reason: "stream id already in use".to_string(),
            });
        }
        self.observe(stream_id);
        self.streams.insert(stream_id, stream);
        Ok(())
    }

    /// Records a peer id that was used without creating a stream
    /// (fire-and-forget, rejected requests).
    pub fn observe(&mut self, stream_id: u32) {
        if self.is_peer_id(stream_id) {
            self.highest_peer = self.highest_peer.max(stream_id);
        }
    }

    pub fn get(&self, stream_id: u32) -> Option<&S> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Option<&mut S> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u32) -> Option<S> {
        self.streams.remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.streams.keys().copied()
    }

    /// Whether `stream_id` has the parity of ids we allocate.
    pub fn is_local_id(&self, stream_id: u32) -> bool {
        stream_id != 0 && stream_id % 2 == self.side.first_id() % 2
    }

    /// Whether `stream_id` has the parity of ids the peer allocates.
    pub fn is_peer_id(&self, stream_id: u32) -> bool {
        stream_id != 0 && !self.is_local_id(stream_id)
    }

    /// Whether `stream_id` is not live but was used earlier on this connection.
    pub fn is_retired(&self, stream_id: u32) -> bool {
        if stream_id == 0 || self.streams.contains_key(&stream_id) {
            return false;
        }
        if self.is_local_id(stream_id) {
            self.exhausted || stream_id < self.next_local
        } else {
            stream_id <= self.highest_peer
        }
    }

    /// Removes every stream (connection teardown).
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, S)> + '_ {
        self.streams.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_allocates_odd_ids() {
        let mut registry: StreamRegistry<()> = StreamRegistry::new(Side::Client);
        assert_eq!(registry.allocate().unwrap(), 1);
        assert_eq!(registry.allocate().unwrap(), 3);
        assert_eq!(registry.allocate().unwrap(), 5);
    }

    #[test]
    fn test_server_allocates_even_ids() {
        let mut registry: StreamRegistry<()> = StreamRegistry::new(Side::Server);
        assert_eq!(registry.allocate().unwrap(), 2);
        assert_eq!(registry.allocate().unwrap(), 4);
        assert!(registry.is_peer_id(1));
        assert!(!registry.is_peer_id(2));
        assert!(!registry.is_peer_id(0));
    }

    #[test]
    fn test_ids_exhaust() {
        let mut registry: StreamRegistry<()> = StreamRegistry::new(Side::Client);
        registry.next_local = MAX_STREAM_ID;
        assert_eq!(registry.allocate().unwrap(), MAX_STREAM_ID);
        assert_eq!(
            registry.allocate().unwrap_err(),
            RSocketError::StreamIdsExhausted
        );
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut registry = StreamRegistry::new(Side::Server);
        registry.register(1, "a").unwrap();
        assert!(matches!(
            registry.register(1, "b"),
            Err(RSocketError::ProtocolViolation { stream_id: 1, .. })
        ));
        assert_eq!(registry.get(1), Some(&"a"));
    }

    #[test]
    fn test_retired_ids() {
        let mut registry = StreamRegistry::new(Side::Client);
        let id = registry.allocate().unwrap();
        registry.register(id, ()).unwrap();
        assert!(!registry.is_retired(id));
        registry.remove(id);
        assert!(registry.is_retired(id));
        // never allocated
        assert!(!registry.is_retired(101));

        // peer ids
        registry.register(4, ()).unwrap();
        registry.remove(4);
        assert!(registry.is_retired(2));
        assert!(registry.is_retired(4));
        assert!(!registry.is_retired(6));

        registry.observe(10);
        assert!(registry.is_retired(8));
    }

    #[test]
    fn test_drain() {
        let mut registry = StreamRegistry::new(Side::Client);
        for _ in 0..3 {
            let id = registry.allocate().unwrap();
            registry.register(id, id).unwrap();
        }
        let mut drained: Vec<_> = registry.drain().map(|(id, _)| id).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 3, 5]);
        assert!(registry.is_empty());
    }
}
