//! Device identity records produced by the discovery sequences

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A device serial number, the primary discovery key.
///
/// Two records with equal serial numbers denote the same physical device.
/// The standard format is 6 bytes; newer devices report a variable-length
/// extended format distinguished by a wire-level flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialNumber {
    Standard([u8; 6]),
    Extended(Vec<u8>),
}

impl SerialNumber {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Standard(b) => b,
            Self::Extended(b) => b,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }

    /// Build a standard serial from a 6-byte slice.
    pub fn standard_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self::Standard)
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard(b) => write!(f, "{}", hex::encode_upper(b)),
            Self::Extended(b) => write!(f, "ext:{}", hex::encode_upper(b)),
        }
    }
}

/// Pre-existing addressing of a device, captured incidentally during
/// discovery. Used to reach a device at its *old* address before the new
/// one is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldComConfig {
    pub bus_id: u8,
    pub node_id: u8,
    pub ip_address: Option<Ipv4Addr>,
}

/// One discovered device.
///
/// Only the serial number is always present; every other field is filled in
/// by the discovery step that learned it. `sub_node_id` and
/// `security_activated` come from extended-format discovery responses only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: SerialNumber,
    /// Valid only after an explicit device-name read.
    pub name: Option<String>,
    pub node_id: Option<u8>,
    /// Ethernet devices only.
    pub ip_address: Option<Ipv4Addr>,
    pub sub_node_id: Option<u8>,
    pub security_activated: bool,
}

impl DeviceIdentity {
    pub fn new(serial: SerialNumber) -> Self {
        Self {
            serial,
            name: None,
            node_id: None,
            ip_address: None,
            sub_node_id: None,
            security_activated: false,
        }
    }

    /// Whether both records describe the same physical device.
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        self.serial == other.serial && self.sub_node_id == other.sub_node_id
    }
}
