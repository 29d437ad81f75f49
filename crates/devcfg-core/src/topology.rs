//! Read-only contract to the network topology model
//!
//! The topology model is an external collaborator (the project's designed
//! network). The engine only queries it: which node a planned address
//! belongs to, which communication interfaces that node has, and what the
//! buses run at. It is never mutated from here; configuration results are
//! reported upward for the caller to persist.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::ProtocolAddress;

/// Physical kind of a communication interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    Can,
    Ethernet,
}

/// One communication interface of a topology node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommInterface {
    pub bus_id: u8,
    pub kind: InterfaceKind,
    /// Interface number within its kind on the device (CAN 1, CAN 2, ...).
    pub number: u8,
    /// Whether the interface is wired up in the current network design.
    pub connected: bool,
}

/// Read-only queries against the designed network.
pub trait NetworkModel: Send + Sync {
    /// Name of the node planned at the given address, if any.
    fn node_at(&self, address: ProtocolAddress) -> Option<String>;

    /// All communication interfaces of the named node (connected or not).
    fn interfaces_of(&self, node: &str) -> Vec<CommInterface>;

    /// Designed bitrate of a CAN bus.
    fn bus_bitrate(&self, bus_id: u8) -> Option<u32>;
}

/// An in-memory topology, useful for tests and as a simple default model.
#[derive(Debug, Default, Clone)]
pub struct StaticNetworkModel {
    nodes: HashMap<String, NodeEntry>,
    bitrates: HashMap<u8, u32>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    addresses: Vec<ProtocolAddress>,
    interfaces: Vec<CommInterface>,
}

impl StaticNetworkModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with its planned addresses and interface set.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        addresses: Vec<ProtocolAddress>,
        interfaces: Vec<CommInterface>,
    ) {
        self.nodes.insert(
            name.into(),
            NodeEntry {
                addresses,
                interfaces,
            },
        );
    }

    pub fn set_bus_bitrate(&mut self, bus_id: u8, bitrate: u32) {
        self.bitrates.insert(bus_id, bitrate);
    }
}

impl NetworkModel for StaticNetworkModel {
    fn node_at(&self, address: ProtocolAddress) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, entry)| entry.addresses.contains(&address))
            .map(|(name, _)| name.clone())
    }

    fn interfaces_of(&self, node: &str) -> Vec<CommInterface> {
        self.nodes
            .get(node)
            .map(|entry| entry.interfaces.clone())
            .unwrap_or_default()
    }

    fn bus_bitrate(&self, bus_id: u8) -> Option<u32> {
        self.bitrates.get(&bus_id).copied()
    }
}
