//! Recording mock of the modern protocol driver
//!
//! Simulates a population of devices and journals every call. Writes are
//! applied to the simulated devices, so a configure-then-read-back
//! sequence observes its own effect: a node id assigned by serial number
//! is the node id a later `connect` resolves.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use devcfg_core::{DeviceIdentity, IpConfig, SerialNumber};

use super::{Channel, ConnectTarget, ModernError, ModernProtocol, ModernSession, ResetTarget};

/// One simulated device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub identity: DeviceIdentity,
    /// Returned by directed name reads and by `broadcast_get_device_info`.
    pub name: Option<String>,
}

/// Every call the mock has observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModernCall {
    EnterProgrammingMode,
    EnterPreProgrammingBroadcast,
    EcuReset(ResetTarget),
    ReadSerialNumbers,
    SetNodeIdBySerial { serial: SerialNumber, node_id: u8 },
    SetIpBySerial { serial: SerialNumber, ip: IpConfig },
    GetDeviceInfo,
    Connect(ConnectTarget),
    SessionEnterPreProgramming(ConnectTarget),
    SessionReadSerial(ConnectTarget),
    SessionReadName(ConnectTarget),
    SessionSetNodeId {
        target: ConnectTarget,
        channel: Channel,
        node_id: u8,
    },
    SessionSetBitrate {
        target: ConnectTarget,
        channel: Channel,
        bitrate: u32,
    },
    SessionSetIp {
        target: ConnectTarget,
        channel: Channel,
        ip: IpConfig,
    },
    SessionClose(ConnectTarget),
}

#[derive(Default)]
struct Shared {
    devices: RwLock<Vec<MockDevice>>,
    journal: Mutex<Vec<ModernCall>>,
    failing_operations: Mutex<HashSet<&'static str>>,
}

impl Shared {
    fn record(&self, call: ModernCall) {
        self.journal.lock().push(call);
    }

    fn check(&self, operation: &'static str) -> Result<(), ModernError> {
        if self.failing_operations.lock().contains(operation) {
            return Err(ModernError::Transport {
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn find(&self, target: ConnectTarget) -> Option<usize> {
        let devices = self.devices.read();
        devices.iter().position(|device| match target {
            ConnectTarget::Node(address) => device.identity.node_id == Some(address.node_id),
            ConnectTarget::Ip { ip, .. } => device.identity.ip_address == Some(ip),
        })
    }
}

/// Scripted modern protocol double.
#[derive(Default)]
pub struct MockModern {
    shared: Arc<Shared>,
}

impl MockModern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, identity: DeviceIdentity, name: Option<&str>) {
        self.shared.devices.write().push(MockDevice {
            identity,
            name: name.map(str::to_string),
        });
    }

    /// Make every future call of `operation` fail. Operation names match
    /// the `ModernError::Transport` operation fields ("connect",
    /// "set can bitrate", ...).
    pub fn fail_operation(&self, operation: &'static str) {
        self.shared.failing_operations.lock().insert(operation);
    }

    pub fn calls(&self) -> Vec<ModernCall> {
        self.shared.journal.lock().clone()
    }

    pub fn call_count(&self, matches: impl Fn(&ModernCall) -> bool) -> usize {
        self.shared.journal.lock().iter().filter(|c| matches(c)).count()
    }

    /// Current state of the simulated devices.
    pub fn devices(&self) -> Vec<MockDevice> {
        self.shared.devices.read().clone()
    }
}

#[async_trait]
impl ModernProtocol for MockModern {
    async fn broadcast_enter_programming_mode(&self) -> Result<(), ModernError> {
        self.shared.check("enter programming mode")?;
        self.shared.record(ModernCall::EnterProgrammingMode);
        Ok(())
    }

    async fn broadcast_enter_pre_programming(&self) -> Result<(), ModernError> {
        self.shared.check("enter pre-programming broadcast")?;
        self.shared.record(ModernCall::EnterPreProgrammingBroadcast);
        Ok(())
    }

    async fn broadcast_ecu_reset(&self, target: ResetTarget) -> Result<(), ModernError> {
        self.shared.check("ecu reset")?;
        self.shared.record(ModernCall::EcuReset(target));
        Ok(())
    }

    async fn broadcast_read_serial_numbers(&self) -> Result<Vec<DeviceIdentity>, ModernError> {
        self.shared.check("read serial numbers")?;
        self.shared.record(ModernCall::ReadSerialNumbers);
        // Discovery does not return names; those take a directed read.
        Ok(self
            .shared
            .devices
            .read()
            .iter()
            .map(|device| DeviceIdentity {
                name: None,
                ..device.identity.clone()
            })
            .collect())
    }

    async fn broadcast_set_node_id_by_serial(
        &self,
        serial: &SerialNumber,
        node_id: u8,
    ) -> Result<(), ModernError> {
        self.shared.check("set node id by serial")?;
        self.shared.record(ModernCall::SetNodeIdBySerial {
            serial: serial.clone(),
            node_id,
        });
        let mut devices = self.shared.devices.write();
        if let Some(device) = devices.iter_mut().find(|d| &d.identity.serial == serial) {
            device.identity.node_id = Some(node_id);
        }
        Ok(())
    }

    async fn broadcast_set_ip_by_serial(
        &self,
        serial: &SerialNumber,
        ip: IpConfig,
    ) -> Result<(), ModernError> {
        self.shared.check("set ip by serial")?;
        self.shared.record(ModernCall::SetIpBySerial {
            serial: serial.clone(),
            ip,
        });
        let mut devices = self.shared.devices.write();
        if let Some(device) = devices.iter_mut().find(|d| &d.identity.serial == serial) {
            device.identity.ip_address = Some(ip.address);
        }
        Ok(())
    }

    async fn broadcast_get_device_info(&self) -> Result<Vec<DeviceIdentity>, ModernError> {
        self.shared.check("get device info")?;
        self.shared.record(ModernCall::GetDeviceInfo);
        Ok(self
            .shared
            .devices
            .read()
            .iter()
            .map(|device| DeviceIdentity {
                name: device.name.clone(),
                ..device.identity.clone()
            })
            .collect())
    }

    async fn connect(&self, target: ConnectTarget) -> Result<Box<dyn ModernSession>, ModernError> {
        self.shared.check("connect")?;
        self.shared.record(ModernCall::Connect(target));
        let Some(index) = self.shared.find(target) else {
            return Err(ModernError::ConnectionFailed(target.to_string()));
        };
        Ok(Box::new(MockSession {
            shared: self.shared.clone(),
            target,
            // Pinned at connect time: the session keeps working while its
            // own writes change the device's address.
            index,
        }))
    }
}

struct MockSession {
    shared: Arc<Shared>,
    target: ConnectTarget,
    index: usize,
}

#[async_trait]
impl ModernSession for MockSession {
    async fn enter_pre_programming(&self) -> Result<(), ModernError> {
        self.shared.check("enter pre-programming")?;
        self.shared
            .record(ModernCall::SessionEnterPreProgramming(self.target));
        Ok(())
    }

    async fn read_serial_number(&self) -> Result<SerialNumber, ModernError> {
        self.shared.check("read serial number")?;
        self.shared.record(ModernCall::SessionReadSerial(self.target));
        Ok(self.shared.devices.read()[self.index].identity.serial.clone())
    }

    async fn read_device_name(&self) -> Result<String, ModernError> {
        self.shared.check("read device name")?;
        self.shared.record(ModernCall::SessionReadName(self.target));
        self.shared.devices.read()[self.index]
            .name
            .clone()
            .ok_or(ModernError::NegativeResponse {
                operation: "read device name",
            })
    }

    async fn set_node_id(&self, channel: Channel, node_id: u8) -> Result<(), ModernError> {
        self.shared.check("set node id")?;
        self.shared.record(ModernCall::SessionSetNodeId {
            target: self.target,
            channel,
            node_id,
        });
        self.shared.devices.write()[self.index].identity.node_id = Some(node_id);
        Ok(())
    }

    async fn set_can_bitrate(&self, channel: Channel, bitrate: u32) -> Result<(), ModernError> {
        self.shared.check("set can bitrate")?;
        self.shared.record(ModernCall::SessionSetBitrate {
            target: self.target,
            channel,
            bitrate,
        });
        Ok(())
    }

    async fn set_ip_config(&self, channel: Channel, ip: IpConfig) -> Result<(), ModernError> {
        self.shared.check("set ip config")?;
        self.shared.record(ModernCall::SessionSetIp {
            target: self.target,
            channel,
            ip,
        });
        self.shared.devices.write()[self.index].identity.ip_address = Some(ip.address);
        Ok(())
    }

    async fn close(&self) -> Result<(), ModernError> {
        self.shared.record(ModernCall::SessionClose(self.target));
        Ok(())
    }
}
