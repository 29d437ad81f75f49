//! Broadcast UDP driver for device discovery
//!
//! One server/client socket pair per accepted local interface. The server
//! socket is bound to the well-known protocol port; the client socket gets
//! a dynamic port with broadcast enabled. Devices answer from the protocol
//! port, so any datagram from another source port is a reflection of our
//! own broadcast and is rejected.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

use super::netif::{discover_interfaces, LocalInterface};
use super::TransportError;

const MAX_DATAGRAM: usize = 1500;

/// Result of one receive poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpRead {
    /// A device response, with the device's IP.
    Data(Vec<u8>, Ipv4Addr),
    /// A datagram from the wrong source port (our own broadcast echoing
    /// back, usually). Received but not accepted.
    NotAccepted(SocketAddr),
    /// Nothing queued on any server socket.
    Empty,
}

struct SocketPair {
    interface: LocalInterface,
    server: UdpSocket,
    client: UdpSocket,
}

/// Fixed pool of per-interface UDP socket pairs.
pub struct UdpPool {
    pairs: Vec<SocketPair>,
    port: u16,
}

impl UdpPool {
    /// Discover local interfaces (honoring the configured preference
    /// file) and bind a pool on them.
    pub fn open(config: &EngineConfig) -> Result<Self, TransportError> {
        let preferred = config
            .preferred_interfaces()
            .map_err(|e| TransportError::SocketSetup(e.to_string()))?;
        let interfaces = discover_interfaces(&preferred);
        Self::bind(&interfaces, config.udp_port)
    }

    /// Bind a server+client pair on every given interface. Interfaces that
    /// fail to bind are skipped with a warning; at least one pair must
    /// come up.
    pub fn bind(interfaces: &[LocalInterface], port: u16) -> Result<Self, TransportError> {
        let mut pairs = Vec::new();
        for interface in interfaces {
            match Self::bind_pair(interface, port) {
                Ok(pair) => {
                    info!(name = %interface.name, ip = %interface.ip, port, "UDP pair bound");
                    pairs.push(pair);
                }
                Err(e) => {
                    warn!(name = %interface.name, ip = %interface.ip, %e, "skipping interface");
                }
            }
        }
        if pairs.is_empty() {
            return Err(TransportError::NoInterfaces);
        }
        Ok(Self { pairs, port })
    }

    fn bind_pair(interface: &LocalInterface, port: u16) -> Result<SocketPair, TransportError> {
        let server = Self::bound_socket(SocketAddrV4::new(interface.ip, port), false)?;
        let client = Self::bound_socket(SocketAddrV4::new(interface.ip, 0), true)?;
        Ok(SocketPair {
            interface: interface.clone(),
            server,
            client,
        })
    }

    fn bound_socket(addr: SocketAddrV4, broadcast: bool) -> Result<UdpSocket, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::SocketSetup(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketSetup(e.to_string()))?;
        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| TransportError::SocketSetup(e.to_string()))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::SocketSetup(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::SocketSetup(format!("bind {addr}: {e}")))?;

        UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::SocketSetup(e.to_string()))
    }

    /// Number of usable socket pairs.
    pub fn interface_count(&self) -> usize {
        self.pairs.len()
    }

    /// Broadcast on every client socket to the protocol port. Failures on
    /// individual interfaces are aggregated, not fatal per send attempt:
    /// every interface is tried before the aggregate status is returned.
    pub async fn send_broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);
        let mut failures = 0usize;
        for pair in &self.pairs {
            match pair.client.send_to(bytes, target).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        interface = %pair.interface.name,
                        %e,
                        "broadcast send failed on interface"
                    );
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(TransportError::SendFailed(format!(
                "broadcast failed on {failures} of {} interfaces",
                self.pairs.len()
            )));
        }
        Ok(())
    }

    /// Poll every server socket once and return the first datagram found.
    /// Only datagrams whose source port is the protocol port are accepted.
    pub fn try_recv(&self) -> Result<UdpRead, TransportError> {
        let mut buffer = [0u8; MAX_DATAGRAM];
        for pair in &self.pairs {
            match pair.server.try_recv_from(&mut buffer) {
                Ok((len, source)) => {
                    if source.port() != self.port {
                        debug!(%source, "datagram from non-protocol port, not accepted");
                        return Ok(UdpRead::NotAccepted(source));
                    }
                    let ip = match source {
                        SocketAddr::V4(v4) => *v4.ip(),
                        SocketAddr::V6(_) => {
                            return Ok(UdpRead::NotAccepted(source));
                        }
                    };
                    return Ok(UdpRead::Data(buffer[..len].to_vec(), ip));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
        Ok(UdpRead::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn loopback_interface() -> LocalInterface {
        LocalInterface {
            name: "lo".to_string(),
            ip: LOCALHOST,
        }
    }

    #[tokio::test]
    async fn accepts_only_protocol_port_sources() {
        // Dynamic port keeps the test isolated from other runs.
        let probe = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let pool = UdpPool::bind(&[loopback_interface()], port).unwrap();

        // A sender on a dynamic port, like a reflection of our own
        // broadcast would be.
        let device = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let device_port = device.local_addr().unwrap().port();

        device
            .send_to(&[0x55], SocketAddrV4::new(LOCALHOST, port))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Wrong source port: received but not accepted.
        match pool.try_recv().unwrap() {
            UdpRead::NotAccepted(source) => assert_eq!(source.port(), device_port),
            other => panic!("expected NotAccepted, got {other:?}"),
        }

        assert_eq!(pool.try_recv().unwrap(), UdpRead::Empty);
    }

    #[tokio::test]
    async fn empty_when_nothing_queued() {
        let probe = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let pool = UdpPool::bind(&[loopback_interface()], port).unwrap();
        assert_eq!(pool.try_recv().unwrap(), UdpRead::Empty);
    }

    #[test]
    fn bind_requires_at_least_one_interface() {
        assert!(matches!(
            UdpPool::bind(&[], 50000),
            Err(TransportError::NoInterfaces)
        ));
    }
}
