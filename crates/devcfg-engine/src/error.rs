//! Sequence-level errors
//!
//! Pre-flight validity errors ([`SequenceError::InvalidTargetConfig`],
//! [`SequenceError::AmbiguousAddressing`]) abort before any network I/O.
//! Driver errors abort the current phase and every remaining iteration of
//! it: a reconfiguration must not leave mixed old/new addressing behind
//! silently.

use thiserror::Error;

use devcfg_core::AddressError;

use crate::legacy::LegacyError;
use crate::modern::ModernError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SequenceError {
    /// Another sequence is still running on the worker.
    #[error("a sequence is already running")]
    Busy,

    #[error("invalid target configuration for {serial}: {reason}")]
    InvalidTargetConfig { serial: String, reason: String },

    /// Discovered addressing is not unique while a security-activated
    /// device is present; a directed handshake could be misrouted.
    #[error("ambiguous addressing: {0}")]
    AmbiguousAddressing(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Legacy(#[from] LegacyError),

    #[error(transparent)]
    Modern(#[from] ModernError),
}
