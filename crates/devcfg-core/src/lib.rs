//! devcfg-core - Core types and contracts for the device configuration engine
//!
//! This crate provides the value types shared between the configuration
//! engine and its callers: protocol addressing (including the 4-byte wire
//! header used by the framed TCP transport), device identities keyed by
//! serial number, target configurations, the read-only network topology
//! contract, and the step/progress event types emitted by the sequencer.

pub mod address;
pub mod event;
pub mod identity;
pub mod target;
pub mod topology;

pub use address::{AddressError, FrameHeader, ProtocolAddress, BROADCAST_NODE_ID};
pub use event::{ConfigStep, SequencerEvent, StepReport, StepStatus};
pub use identity::{DeviceIdentity, OldComConfig, SerialNumber};
pub use target::{DeviceGeneration, IpConfig, TargetDeviceConfiguration};
pub use topology::{CommInterface, InterfaceKind, NetworkModel, StaticNetworkModel};
