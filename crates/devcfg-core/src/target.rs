//! Target configuration value objects
//!
//! A `TargetDeviceConfiguration` is the desired end state for one physical
//! device, keyed by serial number (plus sub node id for multi-CPU nodes).
//! The parallel arrays mirror the device's connected communication
//! interfaces; the sequencer verifies that mirror against the topology model
//! before anything is written to the network.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::identity::{OldComConfig, SerialNumber};

/// Which flashloader protocol generation a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceGeneration {
    /// Local-id / serial-number addressed devices on a single CAN segment.
    Legacy,
    /// Broadcast/session based devices on CAN or Ethernet.
    Modern,
}

/// Address, netmask and gateway for one Ethernet interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Desired end state for one physical device.
///
/// Invariants (checked by the sequencer precheck, not enforced here):
/// `node_ids.len() == bus_ids.len()`; one entry in `can_bitrates` per
/// connected CAN interface; one entry in `ip_configs` per connected
/// Ethernet interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDeviceConfiguration {
    pub serial: SerialNumber,
    pub sub_node_id: Option<u8>,
    pub generation: DeviceGeneration,
    /// Carried over from discovery; selects the directed configuration
    /// strategy when set on any device of a batch.
    pub security_activated: bool,
    /// New node id per connected interface, parallel to `bus_ids`.
    pub node_ids: Vec<u8>,
    /// Bus id per connected interface, parallel to `node_ids`.
    pub bus_ids: Vec<u8>,
    /// One bitrate (bit/s) per connected CAN interface.
    pub can_bitrates: Vec<u32>,
    /// One address triplet per connected Ethernet interface.
    pub ip_configs: Vec<IpConfig>,
    /// The device's addressing before this configuration run, when known.
    pub old_com: Option<OldComConfig>,
}

impl TargetDeviceConfiguration {
    pub fn new(serial: SerialNumber, generation: DeviceGeneration) -> Self {
        Self {
            serial,
            sub_node_id: None,
            generation,
            security_activated: false,
            node_ids: Vec::new(),
            bus_ids: Vec::new(),
            can_bitrates: Vec::new(),
            ip_configs: Vec::new(),
            old_com: None,
        }
    }

    /// The configured (node, bus) pairs in interface order.
    pub fn interface_pairs(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.node_ids.iter().copied().zip(self.bus_ids.iter().copied())
    }

    pub fn is_legacy(&self) -> bool {
        self.generation == DeviceGeneration::Legacy
    }
}
