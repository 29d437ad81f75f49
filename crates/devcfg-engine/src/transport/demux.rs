//! Demultiplexing buffer for misrouted TCP frames
//!
//! Several logical (bus, node) connections can share one physical TCP
//! stream. A frame read for one logical connection but addressed to another
//! is not discarded: it is parked here under its decoded address pair until
//! the owning connection pops it. The buffer is shared by handle across
//! every pool instance that needs it; it is not a process-global.
//!
//! Entries are created lazily on first insert and removed on consumption.
//! There is no eviction: frames accumulate until a matching pop, matching
//! the original tool's behavior.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use devcfg_core::ProtocolAddress;

/// Buffer key: the decoded (target, source) pair of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DemuxKey {
    /// Who the frame was addressed to (the logical client).
    pub target: ProtocolAddress,
    /// Who sent it (the logical server).
    pub source: ProtocolAddress,
}

/// FIFO frame store keyed by address pair, one mutex for all operations.
#[derive(Debug, Default)]
pub struct DemuxBuffer {
    frames: Mutex<HashMap<DemuxKey, VecDeque<Vec<u8>>>>,
}

impl DemuxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a frame payload under its decoded address pair.
    pub fn push(&self, key: DemuxKey, payload: Vec<u8>) {
        self.frames.lock().entry(key).or_default().push_back(payload);
    }

    /// Pop the oldest payload for the pair, if any. The entry is dropped
    /// once its queue drains.
    pub fn pop(&self, client: ProtocolAddress, server: ProtocolAddress) -> Option<Vec<u8>> {
        let key = DemuxKey {
            target: client,
            source: server,
        };
        let mut frames = self.frames.lock();
        let queue = frames.get_mut(&key)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            frames.remove(&key);
        }
        payload
    }

    /// Number of buffered frames across all keys.
    pub fn len(&self) -> usize {
        self.frames.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(bus_id: u8, node_id: u8) -> ProtocolAddress {
        ProtocolAddress { bus_id, node_id }
    }

    #[test]
    fn fifo_single_consumption() {
        let buffer = DemuxBuffer::new();
        let key = DemuxKey {
            target: address(0, 1),
            source: address(0, 2),
        };
        buffer.push(key, vec![0xAA]);
        buffer.push(key, vec![0xBB]);

        assert_eq!(buffer.pop(address(0, 1), address(0, 2)), Some(vec![0xAA]));
        assert_eq!(buffer.pop(address(0, 1), address(0, 2)), Some(vec![0xBB]));
        assert_eq!(buffer.pop(address(0, 1), address(0, 2)), None);
    }

    #[test]
    fn keys_do_not_cross_talk() {
        let buffer = DemuxBuffer::new();
        buffer.push(
            DemuxKey {
                target: address(0, 1),
                source: address(0, 2),
            },
            vec![0x01],
        );

        assert_eq!(buffer.pop(address(0, 2), address(0, 1)), None);
        assert_eq!(buffer.pop(address(0, 1), address(0, 3)), None);
        assert_eq!(buffer.pop(address(0, 1), address(0, 2)), Some(vec![0x01]));
    }

    #[test]
    fn drained_entries_are_removed() {
        let buffer = DemuxBuffer::new();
        let key = DemuxKey {
            target: address(1, 1),
            source: address(1, 2),
        };
        buffer.push(key, vec![0x01]);
        assert_eq!(buffer.len(), 1);
        buffer.pop(address(1, 1), address(1, 2));
        assert!(buffer.is_empty());
    }
}
