//! Local network interface discovery
//!
//! Enumerates active adapters, keeps unicast IPv4 addresses, excludes
//! loopback, and optionally filters to the preferred adapter names from the
//! interface-preference file.

use std::net::Ipv4Addr;

use pnet_datalink::interfaces;
use tracing::{debug, info};

/// One accepted local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Enumerate usable local interfaces. An empty `preferred` list means "use
/// every active non-loopback IPv4 interface".
pub fn discover_interfaces(preferred: &[String]) -> Vec<LocalInterface> {
    let mut accepted = Vec::new();

    for interface in interfaces() {
        if interface.is_loopback() || !interface.is_up() {
            debug!(name = %interface.name, "skipping interface (loopback or down)");
            continue;
        }
        if !preferred.is_empty() && !preferred.iter().any(|p| p == &interface.name) {
            debug!(name = %interface.name, "skipping interface (not in preference list)");
            continue;
        }
        for ip_network in &interface.ips {
            if let std::net::IpAddr::V4(ip) = ip_network.ip() {
                info!(name = %interface.name, %ip, "using network interface");
                accepted.push(LocalInterface {
                    name: interface.name.clone(),
                    ip,
                });
            }
        }
    }

    accepted
}
