//! Configuration sequences
//!
//! Legacy devices first (two passes over all of them: node ids, then
//! bitrates), then modern devices via one of two addressing strategies,
//! both converging into the shared finalization passes. Device loops are
//! sequential and abort on the first error: later passes assume every
//! device completed the earlier ones, which bounds the window for a
//! split-brain bitrate state on the bus.

use tracing::{debug, info};

use devcfg_core::{
    ConfigStep, InterfaceKind, ProtocolAddress, StepReport, StepStatus, TargetDeviceConfiguration,
};

use crate::error::SequenceError;
use crate::modern::{Channel, ConnectTarget, ModernError, ModernSession, ResetTarget};

use super::{precheck, SequencerCtx, SequenceOutput};

/// One configured interface resolved against the topology.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedChannel {
    pub channel: Channel,
    pub address: ProtocolAddress,
}

pub(crate) async fn run_configure(
    ctx: &SequencerCtx,
    targets: &[TargetDeviceConfiguration],
    configure_all_interfaces: bool,
) -> Result<SequenceOutput, SequenceError> {
    // Fail before touching the network: writes are not atomically
    // reversible.
    precheck::check_target_configs(ctx.topology.as_ref(), targets)?;
    ctx.emit_progress(0);

    let legacy: Vec<&TargetDeviceConfiguration> =
        targets.iter().filter(|t| t.is_legacy()).collect();
    configure_legacy_devices(ctx, &legacy).await?;

    let modern: Vec<&TargetDeviceConfiguration> =
        targets.iter().filter(|t| !t.is_legacy()).collect();
    if modern.is_empty() {
        ctx.emit_progress(100);
        return Ok(SequenceOutput::Configured);
    }

    // Broadcasts route by serial number, a global collision-free key, and
    // are therefore safe and fast. Once any device requires a directed
    // security handshake, addressing must already be unambiguous, so
    // everything becomes unicast against the old addresses.
    let any_secure = modern.iter().any(|t| t.security_activated);
    if any_secure {
        apply_directed_strategy(ctx, &modern).await?;
    } else {
        apply_broadcast_strategy(ctx, &modern).await?;
    }
    ctx.emit_progress(30);

    run_shared_finalization(ctx, &modern, configure_all_interfaces).await?;
    ctx.emit_progress(100);
    Ok(SequenceOutput::Configured)
}

/// Two full passes over the legacy devices. Node ids first, bitrates only
/// once every node id is in place: a node-id collision mid-pass is still
/// recoverable as long as the network-wide bitrate has not changed.
async fn configure_legacy_devices(
    ctx: &SequencerCtx,
    targets: &[&TargetDeviceConfiguration],
) -> Result<(), SequenceError> {
    for target in targets {
        ctx.legacy.wake_by_serial(&target.serial).await?;
        let new_id = target.node_ids[0];
        let result = ctx.legacy.set_local_id(&target.serial, new_id).await;
        ctx.emit_step(StepReport {
            step: ConfigStep::SetNodeId,
            status: step_status(&result),
            address: ProtocolAddress {
                bus_id: target.bus_ids[0],
                node_id: new_id,
            },
            interface_kind: InterfaceKind::Can,
            interface_number: 1,
        });
        result?;
    }

    for target in targets {
        let local_id = ctx.legacy.wake_by_serial(&target.serial).await?;
        let Some(&bitrate) = target.can_bitrates.first() else {
            continue;
        };
        let result = ctx.legacy.set_bitrate(local_id, bitrate).await;
        ctx.emit_step(StepReport {
            step: ConfigStep::SetCanBitrate,
            status: step_status(&result),
            address: ProtocolAddress {
                bus_id: target.bus_ids[0],
                node_id: target.node_ids[0],
            },
            interface_kind: InterfaceKind::Can,
            interface_number: 1,
        });
        result?;
    }

    if !targets.is_empty() {
        info!(count = targets.len(), "legacy devices configured");
    }
    Ok(())
}

/// One broadcast per device, keyed by serial number.
async fn apply_broadcast_strategy(
    ctx: &SequencerCtx,
    targets: &[&TargetDeviceConfiguration],
) -> Result<(), SequenceError> {
    for target in targets {
        if let Some(ip) = target.ip_configs.first() {
            ctx.modern
                .broadcast_set_ip_by_serial(&target.serial, *ip)
                .await?;
        } else {
            ctx.modern
                .broadcast_set_node_id_by_serial(&target.serial, target.node_ids[0])
                .await?;
        }
        debug!(serial = %target.serial, "broadcast address assignment sent");
    }
    Ok(())
}

/// Serialized unicast reconfiguration against the devices' old addresses.
/// Each device gets a fresh temporary session; nothing live is reused, so
/// no stale session state can leak between devices.
async fn apply_directed_strategy(
    ctx: &SequencerCtx,
    targets: &[&TargetDeviceConfiguration],
) -> Result<(), SequenceError> {
    for target in targets {
        let Some(old) = target.old_com else {
            return Err(SequenceError::InvalidTargetConfig {
                serial: target.serial.to_string(),
                reason: "directed reconfiguration requires the device's previous address"
                    .to_string(),
            });
        };
        let old_target = match old.ip_address {
            Some(ip) => ConnectTarget::Ip {
                bus_id: old.bus_id,
                ip,
            },
            None => ConnectTarget::Node(ProtocolAddress::new(old.bus_id, old.node_id)?),
        };

        info!(serial = %target.serial, %old_target, "directed reconfiguration");
        let plan = plan_channels(ctx, target)?;
        let session = ctx.modern.connect(old_target).await?;
        session.enter_pre_programming().await?;
        session
            .set_node_id(plan[0].channel, target.node_ids[0])
            .await?;
        if let Some(ip) = target.ip_configs.first() {
            if let Some(ethernet) = plan
                .iter()
                .find(|p| p.channel.kind == InterfaceKind::Ethernet)
            {
                session.set_ip_config(ethernet.channel, *ip).await?;
            }
        }
        session.close().await?;
    }
    Ok(())
}

/// The common final phases of both strategies: reset everything into the
/// flashloader, then per device reconnect + session entry (pass 1),
/// bitrates (pass 2), and when all interfaces are requested, IP addresses
/// (pass 3) and node ids (pass 4). Node ids go last because they are the
/// address every earlier pass routes by.
async fn run_shared_finalization(
    ctx: &SequencerCtx,
    targets: &[&TargetDeviceConfiguration],
    configure_all_interfaces: bool,
) -> Result<(), SequenceError> {
    ctx.modern.broadcast_enter_programming_mode().await?;
    ctx.modern.broadcast_ecu_reset(ResetTarget::Flashloader).await?;
    let ethernet = targets.iter().any(|t| !t.ip_configs.is_empty());
    tokio::time::sleep(ctx.config.settle_time(ethernet)).await;
    ctx.emit_progress(50);

    // Pass 1: every device must be reachable and in its session before
    // any bitrate is touched.
    let mut sessions: Vec<(Box<dyn ModernSession>, Vec<PlannedChannel>)> = Vec::new();
    for target in targets {
        let plan = plan_channels(ctx, target)?;
        let session = ctx.modern.connect(connect_target(target, &plan)).await?;
        session.enter_pre_programming().await?;
        sessions.push((session, plan));
    }
    ctx.emit_progress(60);

    // Pass 2: CAN bitrates.
    for (index, (session, plan)) in sessions.iter().enumerate() {
        let target = targets[index];
        let mut bitrates = target.can_bitrates.iter().copied();
        for planned in plan.iter().filter(|p| p.channel.kind == InterfaceKind::Can) {
            let Some(bitrate) = bitrates.next() else {
                break;
            };
            let result = session.set_can_bitrate(planned.channel, bitrate).await;
            report_step(ctx, ConfigStep::SetCanBitrate, planned, &result);
            result?;
        }
    }
    ctx.emit_progress(70);

    // Pass 3: IP addresses, only when all interfaces are requested.
    if configure_all_interfaces {
        for (index, (session, plan)) in sessions.iter().enumerate() {
            let target = targets[index];
            let mut ips = target.ip_configs.iter().copied();
            for planned in plan
                .iter()
                .filter(|p| p.channel.kind == InterfaceKind::Ethernet)
            {
                let Some(ip) = ips.next() else {
                    break;
                };
                let result = session.set_ip_config(planned.channel, ip).await;
                report_step(ctx, ConfigStep::SetIpAddress, planned, &result);
                result?;
            }
        }
    }
    ctx.emit_progress(80);

    // Pass 4: node ids on every interface, including ones the current
    // connection does not use.
    if configure_all_interfaces {
        for (index, (session, plan)) in sessions.iter().enumerate() {
            let target = targets[index];
            for (planned, node_id) in plan.iter().zip(target.node_ids.iter().copied()) {
                let result = session.set_node_id(planned.channel, node_id).await;
                report_step(ctx, ConfigStep::SetNodeId, planned, &result);
                result?;
            }
        }
    }
    ctx.emit_progress(90);

    for (session, _) in &sessions {
        session.close().await?;
    }
    Ok(())
}

/// Resolve the target's configured pairs to channels via the topology.
/// Precheck guarantees each bus maps to exactly one connected interface.
pub(crate) fn plan_channels(
    ctx: &SequencerCtx,
    target: &TargetDeviceConfiguration,
) -> Result<Vec<PlannedChannel>, SequenceError> {
    let connected = precheck::connected_interfaces(ctx.topology.as_ref(), target)?;
    let mut plan = Vec::with_capacity(target.bus_ids.len());
    for (node_id, bus_id) in target.interface_pairs() {
        let interface = connected
            .iter()
            .find(|i| i.bus_id == bus_id)
            .ok_or_else(|| SequenceError::InvalidTargetConfig {
                serial: target.serial.to_string(),
                reason: format!("bus {bus_id} is not a connected interface"),
            })?;
        plan.push(PlannedChannel {
            channel: Channel {
                kind: interface.kind,
                number: interface.number,
            },
            address: ProtocolAddress::new(bus_id, node_id)?,
        });
    }
    Ok(plan)
}

/// Where to reach the device at its new addressing.
pub(crate) fn connect_target(
    target: &TargetDeviceConfiguration,
    plan: &[PlannedChannel],
) -> ConnectTarget {
    if let Some(ip) = target.ip_configs.first() {
        if let Some(ethernet) = plan
            .iter()
            .find(|p| p.channel.kind == InterfaceKind::Ethernet)
        {
            return ConnectTarget::Ip {
                bus_id: ethernet.address.bus_id,
                ip: ip.address,
            };
        }
    }
    ConnectTarget::Node(plan[0].address)
}

fn step_status<T, E: std::fmt::Display>(result: &Result<T, E>) -> StepStatus {
    match result {
        Ok(_) => StepStatus::Success,
        Err(e) => StepStatus::Failed(e.to_string()),
    }
}

fn report_step(
    ctx: &SequencerCtx,
    step: ConfigStep,
    planned: &PlannedChannel,
    result: &Result<(), ModernError>,
) {
    ctx.emit_step(StepReport {
        step,
        status: step_status(result),
        address: planned.address,
        interface_kind: planned.channel.kind,
        interface_number: planned.channel.number,
    });
}
