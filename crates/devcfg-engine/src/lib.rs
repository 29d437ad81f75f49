//! devcfg-engine - Flashloader discovery and reconfiguration engine
//!
//! This crate drives the multi-phase protocol that scans a CAN or Ethernet
//! device network, wakes devices into flashloader mode, identifies them by
//! serial number, and reassigns node ids, bus ids, bitrates and IP
//! addresses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ConfigSequencer                        │
//! │  scan / configure / read-back state machine               │
//! │  (one worker task, step + progress event stream)          │
//! │                                                          │
//! │   ┌───────────────┐        ┌────────────────────────┐    │
//! │   │ LegacyDriver  │        │ ModernProtocol (trait)  │    │
//! │   │ (local ids)   │        │ broadcast + sessions    │    │
//! │   └───────┬───────┘        └───────────┬────────────┘    │
//! │           │                            │                  │
//! │     ┌─────┴──────┐          ┌──────────┴───────────┐     │
//! │     │ CanDriver  │          │ TcpChannelPool /      │     │
//! │     │ (trait)    │          │ UdpPool               │     │
//! │     └────────────┘          └───────────────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod legacy;
pub mod modern;
pub mod sequencer;
pub mod transport;

pub use config::EngineConfig;
pub use error::SequenceError;
pub use legacy::{LegacyDriver, LegacyError};
pub use modern::{Channel, ConnectTarget, ModernError, ModernProtocol, ModernSession, ResetTarget};
pub use sequencer::{ConfigSequencer, EnterFlashloaderOptions, SequenceOutput};
pub use transport::{
    CanDriver, CanFrame, DemuxBuffer, TcpChannelPool, TcpHandle, TransportError, UdpPool,
};
