//! CAN driver seam
//!
//! The engine talks classic CAN through this trait; the platform adapter
//! (SocketCAN, a vendor interface, ...) plugs in behind it. A scripted
//! in-memory implementation ships for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::TransportError;

/// One classic CAN frame, up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        debug_assert!(data.len() <= 8);
        Self {
            id,
            data: data.to_vec(),
        }
    }
}

/// Transport seam to a classic CAN adapter.
#[async_trait]
pub trait CanDriver: Send + Sync {
    /// Reconfigure the adapter's bitrate (bit/s).
    async fn set_bitrate(&self, bitrate: u32) -> Result<(), TransportError>;

    /// Transmit one frame.
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Receive the next frame, or `None` once `timeout` elapses with
    /// nothing queued. A timeout is stream state, not an error.
    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;
}

/// Scripted CAN double: maps request data prefixes to canned response
/// frames and journals everything sent.
#[derive(Default)]
pub struct MockCan {
    responses: Mutex<Vec<(Vec<u8>, Vec<CanFrame>)>>,
    queue: Mutex<VecDeque<CanFrame>>,
    journal: Mutex<Vec<CanFrame>>,
    fail_sends: Mutex<bool>,
    bitrates: Mutex<Vec<u32>>,
}

impl MockCan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `responses` for any sent frame whose data starts with
    /// `request_prefix`.
    pub fn add_response(&self, request_prefix: Vec<u8>, responses: Vec<CanFrame>) {
        self.responses.lock().push((request_prefix, responses));
    }

    /// Every frame sent so far, in order.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.journal.lock().clone()
    }

    /// Bitrates the adapter was switched to, in order.
    pub fn bitrates_set(&self) -> Vec<u32> {
        self.bitrates.lock().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }
}

#[async_trait]
impl CanDriver for MockCan {
    async fn set_bitrate(&self, bitrate: u32) -> Result<(), TransportError> {
        self.bitrates.lock().push(bitrate);
        Ok(())
    }

    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if *self.fail_sends.lock() {
            return Err(TransportError::SendFailed("mock send failure".to_string()));
        }
        self.journal.lock().push(frame.clone());

        let responses = self.responses.lock();
        for (prefix, frames) in responses.iter() {
            if frame.data.starts_with(prefix) {
                self.queue.lock().extend(frames.iter().cloned());
                break;
            }
        }
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        if let Some(frame) = self.queue.lock().pop_front() {
            return Ok(Some(frame));
        }
        tokio::time::sleep(timeout).await;
        Ok(self.queue.lock().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_response_round_trip() {
        let can = MockCan::new();
        can.add_response(vec![0x01], vec![CanFrame::new(0x123, &[0x41, 0x05])]);

        can.send(CanFrame::new(0x100, &[0x01, 0x05])).await.unwrap();
        let frame = can.recv(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(frame.data, vec![0x41, 0x05]);

        assert!(can
            .recv(Duration::from_millis(1))
            .await
            .unwrap()
            .is_none());
        assert_eq!(can.sent_frames().len(), 1);
    }
}
