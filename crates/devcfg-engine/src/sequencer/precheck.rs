//! Target configuration precheck
//!
//! Reconfiguration is not atomically reversible, so every target is
//! validated against the topology model before a single byte goes out:
//! the configured (node, bus) pairs must all map to one known node, the
//! configured bus set must exactly equal that node's connected interface
//! set, and the bitrate/IP arrays must match the interface counts.

use std::collections::BTreeSet;

use devcfg_core::{
    CommInterface, InterfaceKind, NetworkModel, ProtocolAddress, TargetDeviceConfiguration,
    BROADCAST_NODE_ID,
};

use crate::error::SequenceError;

pub(crate) fn check_target_configs(
    topology: &dyn NetworkModel,
    targets: &[TargetDeviceConfiguration],
) -> Result<(), SequenceError> {
    for target in targets {
        check_one(topology, target)?;
    }
    Ok(())
}

/// The connected interfaces of the node a target maps to, in topology
/// order. Only valid after `check_one` passed.
pub(crate) fn connected_interfaces(
    topology: &dyn NetworkModel,
    target: &TargetDeviceConfiguration,
) -> Result<Vec<CommInterface>, SequenceError> {
    let first = address_of(target, 0)?;
    let node = topology
        .node_at(first)
        .ok_or_else(|| invalid(target, format!("address {first} is not a node")))?;
    Ok(topology
        .interfaces_of(&node)
        .into_iter()
        .filter(|interface| interface.connected)
        .collect())
}

fn check_one(
    topology: &dyn NetworkModel,
    target: &TargetDeviceConfiguration,
) -> Result<(), SequenceError> {
    if target.node_ids.len() != target.bus_ids.len() {
        return Err(invalid(
            target,
            format!(
                "{} node ids for {} bus ids",
                target.node_ids.len(),
                target.bus_ids.len()
            ),
        ));
    }
    if target.node_ids.is_empty() {
        return Err(invalid(target, "no interfaces configured".to_string()));
    }

    // Every pair must be a valid address of one and the same known node.
    let mut node_name: Option<String> = None;
    for index in 0..target.node_ids.len() {
        let address = address_of(target, index)?;
        let Some(name) = topology.node_at(address) else {
            return Err(invalid(
                target,
                format!("address {address} is not a node in the topology"),
            ));
        };
        match &node_name {
            None => node_name = Some(name),
            Some(existing) if *existing != name => {
                return Err(invalid(
                    target,
                    format!("addresses map to different nodes ({existing} and {name})"),
                ));
            }
            _ => {}
        }
    }

    let node_name = node_name.expect("at least one interface pair");
    let connected: Vec<CommInterface> = topology
        .interfaces_of(&node_name)
        .into_iter()
        .filter(|interface| interface.connected)
        .collect();

    // The configured bus set must be exactly the connected interface set:
    // a missing interface is as fatal as an extra one.
    let configured: BTreeSet<u8> = target.bus_ids.iter().copied().collect();
    let actual: BTreeSet<u8> = connected.iter().map(|i| i.bus_id).collect();
    if let Some(bus_id) = actual.difference(&configured).next() {
        return Err(invalid(
            target,
            format!("connected interface on bus {bus_id} is not configured"),
        ));
    }
    if let Some(bus_id) = configured.difference(&actual).next() {
        return Err(invalid(
            target,
            format!("configured bus {bus_id} is not a connected interface of {node_name}"),
        ));
    }
    if target.bus_ids.len() != connected.len() {
        return Err(invalid(
            target,
            format!(
                "{} interface pairs configured, node has {} connected interfaces",
                target.bus_ids.len(),
                connected.len()
            ),
        ));
    }

    let can_count = count_kind(&connected, InterfaceKind::Can);
    if can_count != target.can_bitrates.len() {
        return Err(invalid(
            target,
            format!(
                "{} bitrates for {} CAN interfaces",
                target.can_bitrates.len(),
                can_count
            ),
        ));
    }
    let ethernet_count = count_kind(&connected, InterfaceKind::Ethernet);
    if ethernet_count != target.ip_configs.len() {
        return Err(invalid(
            target,
            format!(
                "{} IP configurations for {} Ethernet interfaces",
                target.ip_configs.len(),
                ethernet_count
            ),
        ));
    }

    Ok(())
}

fn count_kind(interfaces: &[CommInterface], kind: InterfaceKind) -> usize {
    interfaces.iter().filter(|i| i.kind == kind).count()
}

fn address_of(
    target: &TargetDeviceConfiguration,
    index: usize,
) -> Result<ProtocolAddress, SequenceError> {
    let node_id = target.node_ids[index];
    let bus_id = target.bus_ids[index];
    if node_id == BROADCAST_NODE_ID {
        return Err(invalid(
            target,
            format!("node id {BROADCAST_NODE_ID} is reserved for broadcast"),
        ));
    }
    Ok(ProtocolAddress::new(bus_id, node_id)?)
}

fn invalid(target: &TargetDeviceConfiguration, reason: String) -> SequenceError {
    SequenceError::InvalidTargetConfig {
        serial: target.serial.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcfg_core::{DeviceGeneration, IpConfig, SerialNumber, StaticNetworkModel};
    use std::net::Ipv4Addr;

    fn address(bus_id: u8, node_id: u8) -> ProtocolAddress {
        ProtocolAddress { bus_id, node_id }
    }

    fn interface(bus_id: u8, kind: InterfaceKind, number: u8) -> CommInterface {
        CommInterface {
            bus_id,
            kind,
            number,
            connected: true,
        }
    }

    fn ip_config() -> IpConfig {
        IpConfig {
            address: Ipv4Addr::new(192, 168, 1, 20),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    /// Node "gateway" with one CAN interface on bus 0 and one Ethernet
    /// interface on bus 1, planned at node id 5.
    fn topology() -> StaticNetworkModel {
        let mut model = StaticNetworkModel::new();
        model.add_node(
            "gateway",
            vec![address(0, 5), address(1, 5)],
            vec![
                interface(0, InterfaceKind::Can, 1),
                interface(1, InterfaceKind::Ethernet, 1),
            ],
        );
        model
    }

    fn valid_target() -> TargetDeviceConfiguration {
        let mut target = TargetDeviceConfiguration::new(
            SerialNumber::Standard([1, 2, 3, 4, 5, 6]),
            DeviceGeneration::Modern,
        );
        target.node_ids = vec![5, 5];
        target.bus_ids = vec![0, 1];
        target.can_bitrates = vec![500000];
        target.ip_configs = vec![ip_config()];
        target
    }

    #[test]
    fn valid_target_passes() {
        let model = topology();
        assert!(check_target_configs(&model, &[valid_target()]).is_ok());
    }

    #[test]
    fn missing_interface_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        // Drop the Ethernet interface from the configuration.
        target.node_ids = vec![5];
        target.bus_ids = vec![0];
        target.ip_configs = vec![];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidTargetConfig { .. }));
        assert!(err.to_string().contains("bus 1"));
    }

    #[test]
    fn extra_interface_is_rejected() {
        let mut model = topology();
        model.add_node(
            "other",
            vec![address(2, 5)],
            vec![interface(2, InterfaceKind::Can, 1)],
        );
        let mut target = valid_target();
        target.node_ids = vec![5, 5, 5];
        target.bus_ids = vec![0, 1, 2];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        // Address (2,5) belongs to a different node.
        assert!(err.to_string().contains("different nodes"));
    }

    #[test]
    fn unknown_bus_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        target.node_ids = vec![5, 5, 5];
        target.bus_ids = vec![0, 1, 3];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(err.to_string().contains("not a node in the topology"));
    }

    #[test]
    fn bitrate_count_mismatch_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        target.can_bitrates = vec![500000, 250000];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(err.to_string().contains("bitrates"));
    }

    #[test]
    fn ip_count_mismatch_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        target.ip_configs = vec![];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(err.to_string().contains("IP configurations"));
    }

    #[test]
    fn array_length_mismatch_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        target.node_ids = vec![5];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(err.to_string().contains("node ids"));
    }

    #[test]
    fn broadcast_node_id_is_rejected() {
        let model = topology();
        let mut target = valid_target();
        target.node_ids = vec![127, 5];
        let err = check_target_configs(&model, &[target]).unwrap_err();
        assert!(err.to_string().contains("broadcast"));
    }
}
