//! Read-back verification
//!
//! Reconnects to every configured device at its new address, re-enters
//! the session, and re-reads identity (serial number plus device name).
//! The result is the same identity-record list a scan produces, so the
//! caller can diff it against the intended configuration. Any single
//! device failure aborts the remaining read-back.

use tracing::info;

use devcfg_core::{DeviceIdentity, TargetDeviceConfiguration};

use crate::error::SequenceError;
use crate::modern::ModernSession;

use super::configure::{connect_target, plan_channels};
use super::{precheck, SequencerCtx, SequenceOutput};

pub(crate) async fn run_read_back(
    ctx: &SequencerCtx,
    targets: &[TargetDeviceConfiguration],
) -> Result<SequenceOutput, SequenceError> {
    // The same validity the configure path demands; read-back targets are
    // the previously configured set.
    precheck::check_target_configs(ctx.topology.as_ref(), targets)?;

    let modern: Vec<&TargetDeviceConfiguration> =
        targets.iter().filter(|t| !t.is_legacy()).collect();
    let legacy: Vec<&TargetDeviceConfiguration> =
        targets.iter().filter(|t| t.is_legacy()).collect();

    // Reconnect every modern device at its new address first.
    let mut sessions: Vec<Box<dyn ModernSession>> = Vec::new();
    for target in &modern {
        let plan = plan_channels(ctx, target)?;
        let session = ctx.modern.connect(connect_target(target, &plan)).await?;
        session.enter_pre_programming().await?;
        sessions.push(session);
    }

    // Legacy devices must answer under their new local ids.
    for target in &legacy {
        let local_id = target.node_ids[0];
        ctx.legacy.wake_by_local_id(local_id).await?;
        ctx.legacy.identify(local_id).await?;
    }

    // Shared identity read, aggregated into one scan-shaped result.
    let mut identities = Vec::new();
    for (index, session) in sessions.iter().enumerate() {
        let target = modern[index];
        let serial = session.read_serial_number().await?;
        let name = session.read_device_name().await?;

        let mut identity = DeviceIdentity::new(serial);
        identity.name = Some(name);
        identity.node_id = target.node_ids.first().copied();
        identity.ip_address = target.ip_configs.first().map(|ip| ip.address);
        identities.push(identity);
    }
    for target in &legacy {
        let local_id = target.node_ids[0];
        ctx.legacy.wake_by_local_id(local_id).await?;
        let serial = ctx
            .legacy
            .enumerate_serials(local_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SequenceError::InvalidTargetConfig {
                serial: target.serial.to_string(),
                reason: format!("no device answering under local id {local_id}"),
            })?;
        let name = ctx.legacy.read_device_name(local_id).await?;

        let mut identity = DeviceIdentity::new(serial);
        identity.name = Some(name);
        identity.node_id = Some(local_id);
        identities.push(identity);
    }

    for session in &sessions {
        session.close().await?;
    }

    info!(count = identities.len(), "read-back complete");
    Ok(SequenceOutput::Identities(identities))
}
