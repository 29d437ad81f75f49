//! Legacy flashloader driver
//!
//! Directed operations for the older generation of devices, addressed by
//! 8-bit local id or by serial number on a single CAN segment. Every
//! operation is one request/response round trip; the driver never retries,
//! retry policy (if any) belongs to the caller.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use devcfg_core::SerialNumber;

use crate::transport::{CanDriver, CanFrame, TransportError};

use self::frame::{command, positive};

/// Result of an identification query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyIdentification {
    pub local_id: u8,
    pub device_type: u8,
    pub version_major: u8,
    pub version_minor: u8,
}

/// Legacy driver errors
#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("transport failure during {operation}: {source}")]
    Transport {
        operation: &'static str,
        source: TransportError,
    },

    #[error("negative response to {operation} (code 0x{code:02X})")]
    NegativeResponse { operation: &'static str, code: u8 },

    #[error("timeout waiting for response to {operation}")]
    Timeout { operation: &'static str },

    #[error("malformed response to {operation}")]
    InvalidResponse { operation: &'static str },

    #[error("legacy devices carry 6-byte serial numbers, extended format is not addressable")]
    UnsupportedSerialFormat,
}

/// Driver for local-id addressed flashloader devices.
pub struct LegacyDriver {
    can: Arc<dyn CanDriver>,
    request_timeout: Duration,
}

impl LegacyDriver {
    pub fn new(can: Arc<dyn CanDriver>, request_timeout: Duration) -> Self {
        Self {
            can,
            request_timeout,
        }
    }

    /// Wake every device on the segment and collect the local ids that
    /// answered within `window`.
    pub async fn wake_broadcast(&self, window: Duration) -> Result<Vec<u8>, LegacyError> {
        const OP: &str = "wake broadcast";
        self.send(OP, &[command::WAKE_BY_LOCAL_ID, frame::LOCAL_ID_BROADCAST])
            .await?;

        let mut ids = Vec::new();
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv(OP, remaining).await? {
                None => break,
                Some(received) => {
                    if received.data.len() >= 2
                        && received.data[0] == positive(command::WAKE_BY_LOCAL_ID)
                        && !ids.contains(&received.data[1])
                    {
                        debug!(
                            local_id = format!("0x{:02X}", received.data[1]),
                            "device woke up"
                        );
                        ids.push(received.data[1]);
                    }
                }
            }
        }
        info!(count = ids.len(), "wake broadcast complete");
        Ok(ids)
    }

    /// Wake one device by its local id.
    pub async fn wake_by_local_id(&self, local_id: u8) -> Result<(), LegacyError> {
        const OP: &str = "wake by local id";
        let response = self
            .request(OP, &[command::WAKE_BY_LOCAL_ID, local_id])
            .await?;
        if response.get(1) != Some(&local_id) {
            return Err(LegacyError::InvalidResponse { operation: OP });
        }
        Ok(())
    }

    /// Wake one device by serial number; returns the local id it answers
    /// under.
    pub async fn wake_by_serial(&self, serial: &SerialNumber) -> Result<u8, LegacyError> {
        const OP: &str = "wake by serial";
        let SerialNumber::Standard(bytes) = serial else {
            return Err(LegacyError::UnsupportedSerialFormat);
        };
        let mut data = vec![command::WAKE_BY_SERIAL];
        data.extend_from_slice(bytes);
        let response = self.request(OP, &data).await?;
        response
            .get(1)
            .copied()
            .ok_or(LegacyError::InvalidResponse { operation: OP })
    }

    /// Query identification of the device awake under `local_id`.
    pub async fn identify(&self, local_id: u8) -> Result<LegacyIdentification, LegacyError> {
        const OP: &str = "identify";
        let response = self.request(OP, &[command::IDENTIFY, local_id]).await?;
        if response.len() < 5 || response[1] != local_id {
            return Err(LegacyError::InvalidResponse { operation: OP });
        }
        Ok(LegacyIdentification {
            local_id,
            device_type: response[2],
            version_major: response[3],
            version_minor: response[4],
        })
    }

    /// Enumerate the serial numbers answering under one local id. More
    /// than one device can share an id before individualization; the
    /// result is capped at [`frame::MAX_ENUMERATED_SERIALS`].
    pub async fn enumerate_serials(&self, local_id: u8) -> Result<Vec<SerialNumber>, LegacyError> {
        const OP: &str = "enumerate serials";
        self.send(OP, &[command::GET_SERIAL_NUMBER, local_id]).await?;

        let mut serials = Vec::new();
        let deadline = Instant::now() + self.request_timeout;
        while serials.len() < frame::MAX_ENUMERATED_SERIALS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv(OP, remaining).await? {
                None => break,
                Some(can_frame) => {
                    let data = &can_frame.data;
                    if data.len() >= 7 && data[0] == positive(command::GET_SERIAL_NUMBER) {
                        if let Some(serial) = SerialNumber::standard_from_slice(&data[1..7]) {
                            serials.push(serial);
                        }
                    }
                }
            }
        }
        if serials.is_empty() {
            return Err(LegacyError::Timeout { operation: OP });
        }
        Ok(serials)
    }

    /// Read the name of the device awake under `local_id`. Names span
    /// several chunked frames; the high bit of the sequence byte closes
    /// the transfer.
    pub async fn read_device_name(&self, local_id: u8) -> Result<String, LegacyError> {
        const OP: &str = "read device name";
        self.send(OP, &[command::GET_DEVICE_NAME, local_id]).await?;

        let mut name_bytes = Vec::new();
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LegacyError::Timeout { operation: OP });
            }
            let Some(can_frame) = self.recv(OP, remaining).await? else {
                return Err(LegacyError::Timeout { operation: OP });
            };
            let data = &can_frame.data;
            if data.len() < 2 || data[0] != positive(command::GET_DEVICE_NAME) {
                continue;
            }
            name_bytes.extend_from_slice(&data[2..]);
            if data[1] & frame::NAME_LAST_CHUNK != 0 {
                break;
            }
        }

        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        String::from_utf8(name_bytes[..end].to_vec())
            .map_err(|_| LegacyError::InvalidResponse { operation: OP })
    }

    /// Assign a new local id to the device with the given serial number.
    pub async fn set_local_id(
        &self,
        serial: &SerialNumber,
        new_local_id: u8,
    ) -> Result<(), LegacyError> {
        const OP: &str = "set local id";
        let SerialNumber::Standard(bytes) = serial else {
            return Err(LegacyError::UnsupportedSerialFormat);
        };
        let mut data = vec![command::SET_LOCAL_ID];
        data.extend_from_slice(bytes);
        data.push(new_local_id);
        let response = self.request(OP, &data).await?;
        if response.get(1) != Some(&new_local_id) {
            return Err(LegacyError::InvalidResponse { operation: OP });
        }
        info!(serial = %serial, new_local_id, "assigned local id");
        Ok(())
    }

    /// Set the CAN bitrate of the device awake under `local_id`.
    pub async fn set_bitrate(&self, local_id: u8, bitrate: u32) -> Result<(), LegacyError> {
        const OP: &str = "set bitrate";
        let mut data = vec![command::SET_BITRATE, local_id];
        data.extend_from_slice(&bitrate.to_be_bytes());
        let response = self.request(OP, &data).await?;
        if response.get(1) != Some(&local_id) {
            return Err(LegacyError::InvalidResponse { operation: OP });
        }
        info!(local_id, bitrate, "set device bitrate");
        Ok(())
    }

    /// Keep-alive pulse holding woken devices in the flashloader.
    /// Broadcast, no response.
    pub async fn send_flash_pulse(&self) -> Result<(), LegacyError> {
        self.send("flash pulse", &[command::FLASH_PULSE]).await
    }

    /// Reset every legacy device on the segment. Broadcast, no response.
    pub async fn reset_network(&self) -> Result<(), LegacyError> {
        self.send("network reset", &[command::RESET_NETWORK]).await
    }

    async fn send(&self, operation: &'static str, data: &[u8]) -> Result<(), LegacyError> {
        self.can
            .send(CanFrame::new(frame::REQUEST_CAN_ID, data))
            .await
            .map_err(|source| LegacyError::Transport { operation, source })
    }

    async fn recv(
        &self,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<Option<CanFrame>, LegacyError> {
        loop {
            match self
                .can
                .recv(timeout)
                .await
                .map_err(|source| LegacyError::Transport { operation, source })?
            {
                Some(received) if received.id != frame::RESPONSE_CAN_ID => continue,
                other => return Ok(other),
            }
        }
    }

    /// One request/response round trip: send, then wait for the matching
    /// positive response or a negative response to this command.
    async fn request(
        &self,
        operation: &'static str,
        data: &[u8],
    ) -> Result<Vec<u8>, LegacyError> {
        let cmd = data[0];
        self.send(operation, data).await?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LegacyError::Timeout { operation });
            }
            let Some(can_frame) = self.recv(operation, remaining).await? else {
                return Err(LegacyError::Timeout { operation });
            };
            let response = &can_frame.data;
            match response.first() {
                Some(&first) if first == positive(cmd) => return Ok(response.clone()),
                Some(&frame::NEGATIVE_RESPONSE) if response.get(1) == Some(&cmd) => {
                    return Err(LegacyError::NegativeResponse {
                        operation,
                        code: response.get(2).copied().unwrap_or(0),
                    });
                }
                // Response to some earlier command; keep waiting.
                _ => continue,
            }
        }
    }
}
