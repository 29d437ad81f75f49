//! Transport layer: framed TCP channels, broadcast UDP, CAN driver seam
//!
//! The TCP and UDP drivers implement the custom addressing protocol layered
//! over raw sockets; the CAN side is a trait the platform adapter plugs
//! into.

pub mod can;
pub mod demux;
mod error;
pub mod netif;
pub mod tcp;
pub mod udp;

pub use can::{CanDriver, CanFrame};
pub use demux::{DemuxBuffer, DemuxKey};
pub use error::TransportError;
pub use netif::{discover_interfaces, LocalInterface};
pub use tcp::{TcpChannelPool, TcpHandle};
pub use udp::{UdpPool, UdpRead};
