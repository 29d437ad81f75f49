//! Protocol addressing and the legacy wire header
//!
//! Every framed message starts with a 4-byte header: two 16-bit big-endian
//! fields, target first, then source. Each field encodes a (bus, node) pair
//! as `((bus & 0xF) << 7 | (node & 0x7F)) + 1`, so a valid encoded field is
//! never zero.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node id reserved for broadcast; never assigned to a device.
pub const BROADCAST_NODE_ID: u8 = 127;

/// Highest assignable bus id.
pub const MAX_BUS_ID: u8 = 15;

/// Highest assignable node id.
pub const MAX_NODE_ID: u8 = 126;

/// Addressing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("bus id {0} out of range (max {MAX_BUS_ID})")]
    BusIdOutOfRange(u8),

    #[error("node id {0} out of range (max {BROADCAST_NODE_ID})")]
    NodeIdOutOfRange(u8),

    #[error("encoded address field is zero")]
    ZeroField,

    #[error("frame shorter than the 4-byte address header")]
    HeaderTooShort,
}

/// One communication endpoint: a (bus, node) pair.
///
/// Bus ids are 0–15, node ids 0–126; node id 127 addresses every node on a
/// bus and is only valid as a send target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub bus_id: u8,
    pub node_id: u8,
}

impl ProtocolAddress {
    /// Create an address, validating both components. Node id 127 is
    /// accepted (broadcast target).
    pub fn new(bus_id: u8, node_id: u8) -> Result<Self, AddressError> {
        if bus_id > MAX_BUS_ID {
            return Err(AddressError::BusIdOutOfRange(bus_id));
        }
        if node_id > BROADCAST_NODE_ID {
            return Err(AddressError::NodeIdOutOfRange(node_id));
        }
        Ok(Self { bus_id, node_id })
    }

    /// Broadcast address on the given bus.
    pub fn broadcast(bus_id: u8) -> Result<Self, AddressError> {
        Self::new(bus_id, BROADCAST_NODE_ID)
    }

    pub fn is_broadcast(&self) -> bool {
        self.node_id == BROADCAST_NODE_ID
    }

    /// Encode as one 16-bit header field.
    pub fn encode(&self) -> u16 {
        ((((self.bus_id & 0xF) as u16) << 7) | ((self.node_id & 0x7F) as u16)) + 1
    }

    /// Decode one 16-bit header field.
    pub fn decode(field: u16) -> Result<Self, AddressError> {
        if field == 0 {
            return Err(AddressError::ZeroField);
        }
        let value = field - 1;
        Ok(Self {
            node_id: (value & 0x7F) as u8,
            bus_id: ((value >> 7) & 0xF) as u8,
        })
    }
}

impl std::fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.bus_id, self.node_id)
    }
}

/// The 4-byte address header of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Who the frame is for.
    pub target: ProtocolAddress,
    /// Who sent the frame.
    pub source: ProtocolAddress,
}

impl FrameHeader {
    pub fn new(target: ProtocolAddress, source: ProtocolAddress) -> Self {
        Self { target, source }
    }

    /// Serialize to wire order: target field, source field, big-endian.
    pub fn to_bytes(&self) -> [u8; 4] {
        let t = self.target.encode().to_be_bytes();
        let s = self.source.encode().to_be_bytes();
        [t[0], t[1], s[0], s[1]]
    }

    /// Parse the first 4 bytes of a frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, AddressError> {
        if data.len() < 4 {
            return Err(AddressError::HeaderTooShort);
        }
        let target = ProtocolAddress::decode(u16::from_be_bytes([data[0], data[1]]))?;
        let source = ProtocolAddress::decode(u16::from_be_bytes([data[2], data[3]]))?;
        Ok(Self { target, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_decode_round_trip_all_valid_pairs() {
        for bus_id in 0..=MAX_BUS_ID {
            for node_id in 0..=MAX_NODE_ID {
                let addr = ProtocolAddress { bus_id, node_id };
                let decoded = ProtocolAddress::decode(addr.encode()).unwrap();
                assert_eq!(decoded, addr);
            }
        }
    }

    #[test]
    fn encoded_field_is_never_zero() {
        let addr = ProtocolAddress { bus_id: 0, node_id: 0 };
        assert_eq!(addr.encode(), 1);
    }

    #[test]
    fn decode_rejects_zero() {
        assert_eq!(ProtocolAddress::decode(0), Err(AddressError::ZeroField));
    }

    #[test]
    fn new_rejects_out_of_range() {
        assert!(ProtocolAddress::new(16, 0).is_err());
        assert!(ProtocolAddress::new(0, 128).is_err());
        assert!(ProtocolAddress::new(15, 127).is_ok());
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(
            ProtocolAddress { bus_id: 2, node_id: 5 },
            ProtocolAddress { bus_id: 1, node_id: 33 },
        );
        let bytes = header.to_bytes();
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn header_too_short() {
        assert_eq!(
            FrameHeader::from_bytes(&[0x00, 0x01, 0x00]),
            Err(AddressError::HeaderTooShort)
        );
    }
}
