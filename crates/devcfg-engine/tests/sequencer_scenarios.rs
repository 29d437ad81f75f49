//! End-to-end sequencer scenarios against the mock drivers

use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use devcfg_core::{
    CommInterface, ConfigStep, DeviceGeneration, DeviceIdentity, InterfaceKind, IpConfig,
    OldComConfig, ProtocolAddress, SequencerEvent, SerialNumber, StaticNetworkModel, StepStatus,
    TargetDeviceConfiguration,
};
use devcfg_engine::legacy::frame::{command, LOCAL_ID_BROADCAST, RESPONSE_CAN_ID};
use devcfg_engine::modern::mock::{MockModern, ModernCall};
use devcfg_engine::transport::can::MockCan;
use devcfg_engine::{
    CanFrame, ConfigSequencer, ConnectTarget, EngineConfig, EnterFlashloaderOptions,
    SequenceError, SequenceOutput,
};

fn test_config() -> EngineConfig {
    EngineConfig {
        request_timeout_ms: 30,
        default_scan_time_ms: 200,
        can_settle_time_ms: 10,
        ethernet_settle_time_ms: 20,
        ..EngineConfig::default()
    }
}

fn serial(tail: u8) -> SerialNumber {
    SerialNumber::Standard([0xA0, 0xB0, 0xC0, 0xD0, 0xE0, tail])
}

fn address(bus_id: u8, node_id: u8) -> ProtocolAddress {
    ProtocolAddress { bus_id, node_id }
}

fn can_interface(bus_id: u8) -> CommInterface {
    CommInterface {
        bus_id,
        kind: InterfaceKind::Can,
        number: 1,
        connected: true,
    }
}

fn sequencer(
    can: Arc<MockCan>,
    modern: Arc<MockModern>,
    topology: StaticNetworkModel,
) -> ConfigSequencer {
    ConfigSequencer::new(test_config(), can, modern, Arc::new(topology))
}

async fn wait_done(sequencer: &ConfigSequencer) -> Result<SequenceOutput, SequenceError> {
    while sequencer.is_running() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    sequencer.take_result().expect("finished sequence has a result")
}

fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<SequencerEvent>,
) -> Vec<SequencerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn second_start_while_running_is_busy() {
    let seq = sequencer(
        Arc::new(MockCan::new()),
        Arc::new(MockModern::new()),
        StaticNetworkModel::new(),
    );

    seq.start_enter_flashloader(EnterFlashloaderOptions::default())
        .unwrap();
    assert!(matches!(seq.start_scan_legacy(), Err(SequenceError::Busy)));

    // The rejected start leaves the running sequence's result untouched.
    let output = wait_done(&seq).await.unwrap();
    assert_eq!(output, SequenceOutput::EnteredFlashloader);
    assert!(seq.can_initialized());
}

#[tokio::test]
async fn keepalive_loop_terminates_close_to_scan_time() {
    let seq = sequencer(
        Arc::new(MockCan::new()),
        Arc::new(MockModern::new()),
        StaticNetworkModel::new(),
    );

    let started = std::time::Instant::now();
    seq.start_enter_flashloader(EnterFlashloaderOptions::default())
        .unwrap();
    while seq.is_running() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let elapsed = started.elapsed();

    // 200 ms scan time, 5 ms poll granularity, some scheduler slack.
    assert!(elapsed >= Duration::from_millis(195), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(300), "{elapsed:?}");
    assert!(matches!(
        seq.take_result(),
        Some(Ok(SequenceOutput::EnteredFlashloader))
    ));
}

#[tokio::test]
async fn send_failure_aborts_enter_flashloader() {
    let can = Arc::new(MockCan::new());
    can.set_fail_sends(true);
    let seq = sequencer(can, Arc::new(MockModern::new()), StaticNetworkModel::new());

    seq.start_enter_flashloader(EnterFlashloaderOptions {
        include_modern: false,
        ..EnterFlashloaderOptions::default()
    })
    .unwrap();
    assert!(matches!(
        wait_done(&seq).await,
        Err(SequenceError::Legacy(_))
    ));
}

/// Scenario: three legacy devices on distinct local ids, one serial each.
#[tokio::test]
async fn legacy_scan_identifies_three_devices() {
    let can = Arc::new(MockCan::new());

    let wake_responses: Vec<CanFrame> = (1..=3)
        .map(|id| CanFrame::new(RESPONSE_CAN_ID, &[0x41, id]))
        .collect();
    can.add_response(
        vec![command::WAKE_BY_LOCAL_ID, LOCAL_ID_BROADCAST],
        wake_responses,
    );

    let names = [b"Valve1", b"Valve2", b"Valve3"];
    for id in 1u8..=3 {
        can.add_response(
            vec![command::WAKE_BY_LOCAL_ID, id],
            vec![CanFrame::new(RESPONSE_CAN_ID, &[0x41, id])],
        );
        let mut serial_response = vec![0x44];
        serial_response.extend_from_slice(serial(id).as_bytes());
        can.add_response(
            vec![command::GET_SERIAL_NUMBER, id],
            vec![CanFrame::new(RESPONSE_CAN_ID, &serial_response)],
        );
        let mut name_response = vec![0x45, 0x80];
        name_response.extend_from_slice(names[(id - 1) as usize]);
        can.add_response(
            vec![command::GET_DEVICE_NAME, id],
            vec![CanFrame::new(RESPONSE_CAN_ID, &name_response)],
        );
        let mut wake_serial = vec![command::WAKE_BY_SERIAL];
        wake_serial.extend_from_slice(serial(id).as_bytes());
        can.add_response(
            wake_serial,
            vec![CanFrame::new(RESPONSE_CAN_ID, &[0x42, id])],
        );
    }

    let seq = sequencer(can.clone(), Arc::new(MockModern::new()), StaticNetworkModel::new());
    seq.start_scan_legacy().unwrap();
    let output = wait_done(&seq).await.unwrap();

    let SequenceOutput::Identities(identities) = output else {
        panic!("expected identities");
    };
    assert_eq!(identities.len(), 3);
    for (index, identity) in identities.iter().enumerate() {
        let id = (index + 1) as u8;
        assert_eq!(identity.serial, serial(id));
        assert_eq!(identity.node_id, Some(id));
        assert_eq!(
            identity.name.as_deref(),
            Some(std::str::from_utf8(names[index]).unwrap())
        );
    }

    // One serial enumeration and one name read per device, no more.
    let sent = can.sent_frames();
    let enumerations = sent
        .iter()
        .filter(|f| f.data.first() == Some(&command::GET_SERIAL_NUMBER))
        .count();
    let name_reads = sent
        .iter()
        .filter(|f| f.data.first() == Some(&command::GET_DEVICE_NAME))
        .count();
    assert_eq!(enumerations, 3);
    assert_eq!(name_reads, 3);
}

/// Scenario: one modern CAN device, broadcast strategy, full event stream.
#[tokio::test]
async fn broadcast_configure_emits_one_node_id_and_one_bitrate_step() {
    let modern = Arc::new(MockModern::new());
    let mut identity = DeviceIdentity::new(serial(1));
    identity.node_id = Some(4);
    modern.add_device(identity, Some("Gateway"));

    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);

    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.node_ids = vec![5];
    target.bus_ids = vec![0];
    target.can_bitrates = vec![500000];

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    let mut rx = seq.subscribe();
    seq.start_configure(vec![target], true).unwrap();
    let output = wait_done(&seq).await.unwrap();
    assert_eq!(output, SequenceOutput::Configured);

    // Exactly one address-assignment broadcast.
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SetNodeIdBySerial { .. })),
        1
    );
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SetIpBySerial { .. })),
        0
    );

    let events = drain_events(&mut rx);
    let steps: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SequencerEvent::Step(report) => Some(report),
            _ => None,
        })
        .collect();
    let node_id_steps: Vec<_> = steps
        .iter()
        .filter(|s| s.step == ConfigStep::SetNodeId)
        .collect();
    let bitrate_steps: Vec<_> = steps
        .iter()
        .filter(|s| s.step == ConfigStep::SetCanBitrate)
        .collect();
    assert_eq!(node_id_steps.len(), 1);
    assert_eq!(bitrate_steps.len(), 1);
    assert_eq!(node_id_steps[0].status, StepStatus::Success);
    assert_eq!(bitrate_steps[0].status, StepStatus::Success);

    // Progress is monotonic and complete.
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SequencerEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 30, 50, 60, 70, 80, 90, 100]);
}

/// Security on any device forces the directed strategy for all of them.
#[tokio::test]
async fn security_forces_directed_strategy() {
    let modern = Arc::new(MockModern::new());
    let mut secure = DeviceIdentity::new(serial(1));
    secure.node_id = Some(4);
    secure.security_activated = true;
    modern.add_device(secure, Some("Gateway"));
    let mut plain = DeviceIdentity::new(serial(2));
    plain.node_id = Some(6);
    modern.add_device(plain, Some("Sensor"));

    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);
    topology.add_node("sensor", vec![address(0, 7)], vec![can_interface(0)]);

    let mut first = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    first.security_activated = true;
    first.node_ids = vec![5];
    first.bus_ids = vec![0];
    first.can_bitrates = vec![250000];
    first.old_com = Some(OldComConfig {
        bus_id: 0,
        node_id: 4,
        ip_address: None,
    });
    let mut second = TargetDeviceConfiguration::new(serial(2), DeviceGeneration::Modern);
    second.node_ids = vec![7];
    second.bus_ids = vec![0];
    second.can_bitrates = vec![250000];
    second.old_com = Some(OldComConfig {
        bus_id: 0,
        node_id: 6,
        ip_address: None,
    });

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    seq.start_configure(vec![first, second], true).unwrap();
    let output = wait_done(&seq).await.unwrap();
    assert_eq!(output, SequenceOutput::Configured);

    // No broadcast assignment at all; each device was reached at its old
    // address with a fresh session.
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SetNodeIdBySerial { .. })),
        0
    );
    let calls = modern.calls();
    assert!(calls.contains(&ModernCall::Connect(ConnectTarget::Node(address(0, 4)))));
    assert!(calls.contains(&ModernCall::Connect(ConnectTarget::Node(address(0, 6)))));
}

#[tokio::test]
async fn directed_strategy_requires_old_address() {
    let modern = Arc::new(MockModern::new());
    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);

    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.security_activated = true;
    target.node_ids = vec![5];
    target.bus_ids = vec![0];
    target.can_bitrates = vec![500000];

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    seq.start_configure(vec![target], true).unwrap();
    assert!(matches!(
        wait_done(&seq).await,
        Err(SequenceError::InvalidTargetConfig { .. })
    ));
}

#[tokio::test]
async fn invalid_target_aborts_before_any_network_io() {
    let modern = Arc::new(MockModern::new());
    let can = Arc::new(MockCan::new());
    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);

    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.node_ids = vec![5];
    target.bus_ids = vec![0];
    // Wrong: two bitrates for one CAN interface.
    target.can_bitrates = vec![500000, 250000];

    let seq = sequencer(can.clone(), modern.clone(), topology);
    seq.start_configure(vec![target], true).unwrap();
    assert!(matches!(
        wait_done(&seq).await,
        Err(SequenceError::InvalidTargetConfig { .. })
    ));

    assert!(modern.calls().is_empty());
    assert!(can.sent_frames().is_empty());
}

#[tokio::test]
async fn can_scan_fetches_names_only_for_unique_node_ids() {
    let modern = Arc::new(MockModern::new());
    let mut unique = DeviceIdentity::new(serial(1));
    unique.node_id = Some(7);
    modern.add_device(unique, Some("Alpha"));
    // Two devices still sharing a node id; tolerated without security,
    // but their names cannot be read by address yet.
    let mut first_clash = DeviceIdentity::new(serial(2));
    first_clash.node_id = Some(5);
    modern.add_device(first_clash, Some("Beta"));
    let mut second_clash = DeviceIdentity::new(serial(3));
    second_clash.node_id = Some(5);
    modern.add_device(second_clash, Some("Gamma"));

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), StaticNetworkModel::new());
    seq.start_scan_modern_can(0).unwrap();
    let output = wait_done(&seq).await.unwrap();

    let SequenceOutput::Identities(identities) = output else {
        panic!("expected identities");
    };
    assert_eq!(identities.len(), 3);
    assert_eq!(identities[0].name.as_deref(), Some("Alpha"));
    assert_eq!(identities[1].name, None);
    assert_eq!(identities[2].name, None);

    // Exactly one directed name read, for the unique device.
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SessionReadName(_))),
        1
    );
}

#[tokio::test]
async fn ethernet_scan_returns_identity_ip_and_name_in_one_pass() {
    let modern = Arc::new(MockModern::new());
    let mut identity = DeviceIdentity::new(serial(1));
    identity.node_id = Some(3);
    identity.ip_address = Some(Ipv4Addr::new(192, 168, 1, 30));
    modern.add_device(identity, Some("IoModule"));

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), StaticNetworkModel::new());
    seq.start_scan_modern_ethernet().unwrap();
    let output = wait_done(&seq).await.unwrap();

    let SequenceOutput::Identities(identities) = output else {
        panic!("expected identities");
    };
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].name.as_deref(), Some("IoModule"));
    assert_eq!(identities[0].ip_address, Some(Ipv4Addr::new(192, 168, 1, 30)));

    // Reset into flashloader happened before the info broadcast.
    let calls = modern.calls();
    assert!(calls.contains(&ModernCall::EnterProgrammingMode));
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::GetDeviceInfo)),
        1
    );
}

#[tokio::test]
async fn ethernet_scan_rejects_ip_clash_under_security() {
    let modern = Arc::new(MockModern::new());
    let ip = Ipv4Addr::new(192, 168, 1, 40);
    let mut first = DeviceIdentity::new(serial(1));
    first.node_id = Some(3);
    first.ip_address = Some(ip);
    first.security_activated = true;
    modern.add_device(first, Some("A"));
    let mut second = DeviceIdentity::new(serial(2));
    second.node_id = Some(4);
    second.ip_address = Some(ip);
    modern.add_device(second, Some("B"));

    let seq = sequencer(Arc::new(MockCan::new()), modern, StaticNetworkModel::new());
    seq.start_scan_modern_ethernet().unwrap();
    assert!(matches!(
        wait_done(&seq).await,
        Err(SequenceError::AmbiguousAddressing(_))
    ));
}

#[tokio::test]
async fn read_back_reconnects_at_new_address() {
    let modern = Arc::new(MockModern::new());
    let mut identity = DeviceIdentity::new(serial(1));
    identity.node_id = Some(5);
    modern.add_device(identity, Some("Gateway"));

    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);

    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.node_ids = vec![5];
    target.bus_ids = vec![0];
    target.can_bitrates = vec![500000];

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    seq.start_read_back(vec![target]).unwrap();
    let output = wait_done(&seq).await.unwrap();

    let SequenceOutput::Identities(identities) = output else {
        panic!("expected identities");
    };
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].serial, serial(1));
    assert_eq!(identities[0].name.as_deref(), Some("Gateway"));
    assert_eq!(identities[0].node_id, Some(5));

    let calls = modern.calls();
    assert!(calls.contains(&ModernCall::Connect(ConnectTarget::Node(address(0, 5)))));
    assert!(calls.contains(&ModernCall::SessionReadSerial(ConnectTarget::Node(
        address(0, 5)
    ))));
}

#[tokio::test]
async fn configure_failure_stops_remaining_devices() {
    let modern = Arc::new(MockModern::new());
    let mut identity = DeviceIdentity::new(serial(1));
    identity.node_id = Some(4);
    modern.add_device(identity, Some("Gateway"));
    modern.fail_operation("set can bitrate");

    let mut topology = StaticNetworkModel::new();
    topology.add_node("gateway", vec![address(0, 5)], vec![can_interface(0)]);

    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.node_ids = vec![5];
    target.bus_ids = vec![0];
    target.can_bitrates = vec![500000];

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    let mut rx = seq.subscribe();
    seq.start_configure(vec![target], true).unwrap();
    assert!(matches!(
        wait_done(&seq).await,
        Err(SequenceError::Modern(_))
    ));

    // The failed step was still reported with its address.
    let events = drain_events(&mut rx);
    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SequencerEvent::Step(report) if !report.status.is_success() => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step, ConfigStep::SetCanBitrate);
    assert_eq!(failed[0].address, address(0, 5));

    // Node ids were never touched: the sequence stopped in the bitrate
    // pass.
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SessionSetNodeId { .. })),
        0
    );
}

/// IpConfig is carried per Ethernet interface and written in the IP pass.
#[tokio::test]
async fn ethernet_configure_uses_ip_broadcast_and_ip_pass() {
    let modern = Arc::new(MockModern::new());
    let mut identity = DeviceIdentity::new(serial(1));
    identity.node_id = Some(3);
    identity.ip_address = Some(Ipv4Addr::new(192, 168, 1, 10));
    modern.add_device(identity, Some("IoModule"));

    let mut topology = StaticNetworkModel::new();
    topology.add_node(
        "iomodule",
        vec![address(1, 9)],
        vec![CommInterface {
            bus_id: 1,
            kind: InterfaceKind::Ethernet,
            number: 1,
            connected: true,
        }],
    );

    let new_ip = IpConfig {
        address: Ipv4Addr::new(192, 168, 1, 77),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
    };
    let mut target = TargetDeviceConfiguration::new(serial(1), DeviceGeneration::Modern);
    target.node_ids = vec![9];
    target.bus_ids = vec![1];
    target.ip_configs = vec![new_ip];

    let seq = sequencer(Arc::new(MockCan::new()), modern.clone(), topology);
    seq.start_configure(vec![target], true).unwrap();
    let output = wait_done(&seq).await.unwrap();
    assert_eq!(output, SequenceOutput::Configured);

    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SetIpBySerial { .. })),
        1
    );
    assert_eq!(
        modern.call_count(|c| matches!(c, ModernCall::SessionSetIp { .. })),
        1
    );
    // The device ends up at the new address.
    assert_eq!(
        modern.devices()[0].identity.ip_address,
        Some(Ipv4Addr::new(192, 168, 1, 77))
    );
}
