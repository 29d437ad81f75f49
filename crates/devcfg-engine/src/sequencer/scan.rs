//! Scan sequences: flashloader entry and identity collection

use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::{info, warn};

use devcfg_core::{DeviceIdentity, InterfaceKind, ProtocolAddress};

use crate::error::SequenceError;
use crate::modern::{ConnectTarget, ResetTarget};

use super::{EnterFlashloaderOptions, SequencerCtx, SequenceOutput};

/// Wake devices into flashloader mode, then hold them there.
///
/// The keep-alive loop runs for at least the configured default scan time
/// or the options' minimum wait, whichever is longer, and keeps going past
/// that while the keep-scanning flag stays set (manual scanning). Any send
/// failure aborts the whole sequence.
pub(crate) async fn run_enter_flashloader(
    ctx: &SequencerCtx,
    options: EnterFlashloaderOptions,
) -> Result<SequenceOutput, SequenceError> {
    if options.transport == InterfaceKind::Can {
        ctx.can.set_bitrate(ctx.config.can_bitrate).await?;
        *ctx.can_initialized.lock() = true;
    }

    if options.include_modern {
        ctx.modern.broadcast_enter_programming_mode().await?;
        ctx.modern.broadcast_ecu_reset(ResetTarget::Flashloader).await?;
    }
    if options.include_legacy {
        ctx.legacy.reset_network().await?;
    }

    let scan_for = ctx.config.default_scan_time().max(options.minimum_wait);
    let deadline = Instant::now() + scan_for;
    info!(scan_ms = scan_for.as_millis() as u64, "holding devices in flashloader");

    loop {
        if options.include_legacy {
            ctx.legacy.send_flash_pulse().await?;
        }
        if options.include_modern {
            ctx.modern.broadcast_enter_pre_programming().await?;
        }
        tokio::time::sleep(ctx.config.keepalive_period()).await;

        if Instant::now() >= deadline && !ctx.keep_scanning.load(Ordering::SeqCst) {
            break;
        }
    }

    Ok(SequenceOutput::EnteredFlashloader)
}

/// Collect complete identities of every legacy device.
///
/// Wake broadcast first, then per responding local id: wake, enumerate
/// the serial numbers sharing that id, and per serial wake the one device
/// and read its name. The first failure aborts the whole scan.
pub(crate) async fn run_scan_legacy(ctx: &SequencerCtx) -> Result<SequenceOutput, SequenceError> {
    let local_ids = ctx
        .legacy
        .wake_broadcast(ctx.config.request_timeout())
        .await?;
    info!(responding = local_ids.len(), "legacy wake broadcast done");

    let mut identities = Vec::new();
    for local_id in local_ids {
        ctx.legacy.wake_by_local_id(local_id).await?;
        let serials = ctx.legacy.enumerate_serials(local_id).await?;
        for serial in serials {
            // Waking by serial singles the device out from any id sharers
            // before the name read.
            ctx.legacy.wake_by_serial(&serial).await?;
            let name = ctx.legacy.read_device_name(local_id).await?;

            let mut identity = DeviceIdentity::new(serial);
            identity.name = Some(name);
            identity.node_id = Some(local_id);
            info!(serial = %identity.serial, local_id, "legacy device identified");
            identities.push(identity);
        }
    }

    Ok(SequenceOutput::Identities(identities))
}

/// Collect modern device identities on one CAN bus.
pub(crate) async fn run_scan_modern_can(
    ctx: &SequencerCtx,
    bus_id: u8,
) -> Result<SequenceOutput, SequenceError> {
    // Standard and extended format responses arrive in the same pass.
    let mut identities = ctx.modern.broadcast_read_serial_numbers().await?;
    check_address_uniqueness(&identities, false)?;

    // Names take a directed read, which is only well-addressed for
    // devices whose node id is unique in the discovered set.
    for index in 0..identities.len() {
        let Some(node_id) = identities[index].node_id else {
            continue;
        };
        if !node_id_is_unique(&identities, index) {
            continue;
        }
        let address = ProtocolAddress::new(bus_id, node_id)?;
        let session = ctx.modern.connect(ConnectTarget::Node(address)).await?;
        let name = session.read_device_name().await?;
        session.close().await?;
        identities[index].name = Some(name);
    }

    info!(count = identities.len(), "modern CAN identity scan complete");
    Ok(SequenceOutput::Identities(identities))
}

/// Collect modern device identities over Ethernet.
///
/// The settle wait is longer than on CAN: an IP reconfiguration restarts
/// the device's network stack before it answers again.
pub(crate) async fn run_scan_modern_ethernet(
    ctx: &SequencerCtx,
) -> Result<SequenceOutput, SequenceError> {
    ctx.modern.broadcast_enter_programming_mode().await?;
    ctx.modern.broadcast_ecu_reset(ResetTarget::Flashloader).await?;
    tokio::time::sleep(ctx.config.settle_time(true)).await;

    // Identity, IP and name arrive in one pass; no directed reads needed.
    let identities = ctx.modern.broadcast_get_device_info().await?;
    check_address_uniqueness(&identities, true)?;

    info!(
        count = identities.len(),
        "modern Ethernet identity scan complete"
    );
    Ok(SequenceOutput::Identities(identities))
}

/// Pairwise addressing-uniqueness check over a discovered set.
///
/// Duplicates are tolerated (uniqueness is re-established during
/// configuration) unless any device is security-activated: the directed
/// security handshake routes by address, and an ambiguous address could
/// deliver it to the wrong device.
pub(crate) fn check_address_uniqueness(
    identities: &[DeviceIdentity],
    require_unique_ip: bool,
) -> Result<(), SequenceError> {
    let any_secure = identities.iter().any(|d| d.security_activated);

    for i in 0..identities.len() {
        for j in (i + 1)..identities.len() {
            let a = &identities[i];
            let b = &identities[j];

            let node_clash = a.node_id.is_some() && a.node_id == b.node_id;
            let ip_clash = require_unique_ip && a.ip_address.is_some() && a.ip_address == b.ip_address;
            if !node_clash && !ip_clash {
                continue;
            }

            let what = if node_clash { "node id" } else { "IP address" };
            if any_secure {
                return Err(SequenceError::AmbiguousAddressing(format!(
                    "devices {} and {} share a {what} while security is active",
                    a.serial, b.serial
                )));
            }
            warn!(
                first = %a.serial,
                second = %b.serial,
                "{what} clash in scan result, will be resolved during configuration"
            );
        }
    }
    Ok(())
}

fn node_id_is_unique(identities: &[DeviceIdentity], index: usize) -> bool {
    let node_id = identities[index].node_id;
    identities
        .iter()
        .enumerate()
        .all(|(other, identity)| other == index || identity.node_id != node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcfg_core::SerialNumber;

    fn identity(serial_tail: u8, node_id: Option<u8>, secure: bool) -> DeviceIdentity {
        let mut identity =
            DeviceIdentity::new(SerialNumber::Standard([0, 0, 0, 0, 0, serial_tail]));
        identity.node_id = node_id;
        identity.security_activated = secure;
        identity
    }

    #[test]
    fn duplicate_node_ids_tolerated_without_security() {
        let identities = vec![identity(1, Some(5), false), identity(2, Some(5), false)];
        assert!(check_address_uniqueness(&identities, false).is_ok());
    }

    #[test]
    fn duplicate_node_ids_fatal_with_security() {
        let identities = vec![identity(1, Some(5), true), identity(2, Some(5), false)];
        assert!(matches!(
            check_address_uniqueness(&identities, false),
            Err(SequenceError::AmbiguousAddressing(_))
        ));
    }

    #[test]
    fn duplicate_ips_fatal_with_security_on_ethernet() {
        let mut a = identity(1, Some(4), false);
        let mut b = identity(2, Some(5), true);
        a.ip_address = Some(std::net::Ipv4Addr::new(192, 168, 1, 9));
        b.ip_address = Some(std::net::Ipv4Addr::new(192, 168, 1, 9));
        let identities = vec![a, b];

        assert!(check_address_uniqueness(&identities, false).is_ok());
        assert!(matches!(
            check_address_uniqueness(&identities, true),
            Err(SequenceError::AmbiguousAddressing(_))
        ));
    }

    #[test]
    fn distinct_addresses_pass_with_security() {
        let identities = vec![identity(1, Some(4), true), identity(2, Some(5), true)];
        assert!(check_address_uniqueness(&identities, true).is_ok());
    }
}
