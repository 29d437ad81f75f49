//! Step and progress events emitted by the configuration sequencer
//!
//! A sequence stops at the first error, but the per-step reports name the
//! exact device and interface a write succeeded or failed on, so the caller
//! can render more than a terminal pass/fail.

use serde::{Deserialize, Serialize};

use crate::address::ProtocolAddress;
use crate::topology::InterfaceKind;

/// Which configuration write a step report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigStep {
    SetNodeId,
    SetCanBitrate,
    SetIpAddress,
}

/// Outcome of one configuration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed(String),
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One configuration write on one device interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: ConfigStep,
    pub status: StepStatus,
    pub address: ProtocolAddress,
    pub interface_kind: InterfaceKind,
    pub interface_number: u8,
}

/// Event stream of a running sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SequencerEvent {
    Step(StepReport),
    /// Monotonic percentage through the configuration phases.
    Progress(u8),
}
