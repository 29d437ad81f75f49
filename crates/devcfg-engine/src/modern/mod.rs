//! Modern protocol driver contract
//!
//! The broadcast/session based protocol of current-generation devices.
//! The wire format is a fixed external protocol; this module specifies the
//! engine's contract with it at the call level and ships a recording mock
//! for tests. Broadcast services live on [`ModernProtocol`]; everything
//! directed requires a connection to a specific (bus, node) or (bus, ip)
//! address and lives on [`ModernSession`].

pub mod mock;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use devcfg_core::{DeviceIdentity, InterfaceKind, IpConfig, ProtocolAddress, SerialNumber};

/// Where an ECU reset broadcast sends the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    /// Stay in the flashloader for reprogramming.
    Flashloader,
    /// Return to normal run-time firmware.
    Run,
}

/// Address a directed session is opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTarget {
    Node(ProtocolAddress),
    Ip { bus_id: u8, ip: Ipv4Addr },
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(address) => write!(f, "node {address}"),
            Self::Ip { bus_id, ip } => write!(f, "bus {bus_id} ip {ip}"),
        }
    }
}

/// One configuration channel (communication interface) on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub kind: InterfaceKind,
    pub number: u8,
}

/// Modern driver errors
#[derive(Debug, Error)]
pub enum ModernError {
    #[error("transport failure during {operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    #[error("negative response to {operation}")]
    NegativeResponse { operation: &'static str },

    #[error("connection to {0} failed")]
    ConnectionFailed(String),

    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },
}

/// Broadcast services of the modern protocol.
#[async_trait]
pub trait ModernProtocol: Send + Sync {
    /// Ask every listening device to open its programming mode.
    async fn broadcast_enter_programming_mode(&self) -> Result<(), ModernError>;

    /// Keep-alive broadcast holding woken devices in the pre-programming
    /// session.
    async fn broadcast_enter_pre_programming(&self) -> Result<(), ModernError>;

    /// Reset every listening device into the flashloader or back to run.
    async fn broadcast_ecu_reset(&self, target: ResetTarget) -> Result<(), ModernError>;

    /// One pass collecting standard- and extended-format serial number
    /// responses from every device.
    async fn broadcast_read_serial_numbers(&self) -> Result<Vec<DeviceIdentity>, ModernError>;

    /// Assign a node id keyed by serial number (standard or extended).
    async fn broadcast_set_node_id_by_serial(
        &self,
        serial: &SerialNumber,
        node_id: u8,
    ) -> Result<(), ModernError>;

    /// Assign an IP configuration keyed by serial number. Ethernet only.
    async fn broadcast_set_ip_by_serial(
        &self,
        serial: &SerialNumber,
        ip: IpConfig,
    ) -> Result<(), ModernError>;

    /// Identity, IP and name of every device in one pass. Ethernet only.
    async fn broadcast_get_device_info(&self) -> Result<Vec<DeviceIdentity>, ModernError>;

    /// Open a directed session to one device.
    async fn connect(&self, target: ConnectTarget) -> Result<Box<dyn ModernSession>, ModernError>;
}

/// Directed services on an established connection.
#[async_trait]
pub trait ModernSession: Send + Sync {
    async fn enter_pre_programming(&self) -> Result<(), ModernError>;

    async fn read_serial_number(&self) -> Result<SerialNumber, ModernError>;

    async fn read_device_name(&self) -> Result<String, ModernError>;

    async fn set_node_id(&self, channel: Channel, node_id: u8) -> Result<(), ModernError>;

    async fn set_can_bitrate(&self, channel: Channel, bitrate: u32) -> Result<(), ModernError>;

    async fn set_ip_config(&self, channel: Channel, ip: IpConfig) -> Result<(), ModernError>;

    /// Tear the session down. Further calls on this session fail.
    async fn close(&self) -> Result<(), ModernError>;
}
