//! Network interface and liveness utilities.
//!
//! Interface selection feeds both sides of discovery: multicast sockets
//! join the group on every eligible interface, and the legacy sweep
//! enumerates candidate host addresses from each interface's subnet.
//!
//! An interface is eligible when it is up with a non-loopback IPv4
//! address and is not a point-to-point tunnel. Tunnels are recognised
//! by the absence of a broadcast address plus the usual name prefixes
//! (`tun`, `utun`, `tap`, `wg`, `ppp`).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Default timeout for an ICMP echo probe.
pub const ICMP_TIMEOUT: Duration = Duration::from_millis(200);

/// Default timeout for a TCP connect probe.
pub const TCP_TIMEOUT: Duration = Duration::from_millis(500);

/// Cap on generated host addresses per subnet.
const MAX_HOSTS: usize = 254;

/// An eligible IPv4 interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    /// OS interface name
    pub name: String,
    /// Interface IPv4 address
    pub ip: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
}

impl Iface {
    /// Number of host bits in this interface's subnet.
    #[must_use]
    pub fn host_bits(&self) -> u32 {
        u32::from(self.netmask).count_zeros()
    }

    /// The subnet's network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.netmask))
    }
}

fn looks_point_to_point(name: &str) -> bool {
    const P2P_PREFIXES: [&str; 5] = ["tun", "utun", "tap", "wg", "ppp"];
    P2P_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Enumerate eligible multicast-capable IPv4 interfaces.
///
/// Loopback, point-to-point, and IPv6-only interfaces are rejected.
/// An optional `only` restricts the result to one named interface
/// (the configured `interface` setting when it is not `all`).
pub fn eligible_interfaces(only: Option<&str>) -> Result<Vec<Iface>> {
    let mut out = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() || looks_point_to_point(&iface.name) {
            continue;
        }
        if let Some(name) = only {
            if iface.name != name {
                continue;
            }
        }
        let if_addrs::IfAddr::V4(v4) = &iface.addr else {
            continue;
        };
        // A missing broadcast address marks the remaining tunnels.
        if v4.broadcast.is_none() {
            continue;
        }
        out.push(Iface {
            name: iface.name,
            ip: v4.ip,
            netmask: v4.netmask,
        });
    }
    if out.is_empty() {
        return Err(Error::NoInterface);
    }
    Ok(out)
}

/// Every local IPv4 address, loopback included.
///
/// Used to exclude ourselves from sweep targets and to compose share
/// URLs for the management API.
#[must_use]
pub fn local_ipv4s() -> HashSet<Ipv4Addr> {
    let mut set = HashSet::new();
    set.insert(Ipv4Addr::LOCALHOST);
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            if let if_addrs::IfAddr::V4(v4) = iface.addr {
                set.insert(v4.ip);
            }
        }
    }
    set
}

/// First non-loopback IPv4, preferring eligible interfaces.
#[must_use]
pub fn primary_ipv4() -> Option<Ipv4Addr> {
    eligible_interfaces(None)
        .ok()
        .and_then(|ifaces| ifaces.first().map(|i| i.ip))
}

/// Local address to bind outbound dials to when a concrete interface
/// is configured; `None` when the configuration says `all`.
pub fn outgoing_bind_addr(iface_name: &str) -> Result<Option<Ipv4Addr>> {
    if iface_name.is_empty() || iface_name == "all" {
        return Ok(None);
    }
    let ifaces = eligible_interfaces(Some(iface_name))?;
    Ok(ifaces.first().map(|i| i.ip))
}

/// Generate candidate host addresses for an interface's subnet.
///
/// For /24 and smaller subnets this is the full linear range
/// `.1 ..= .254`; larger subnets are capped to 254 addresses around
/// the interface address. The network address is always skipped.
#[must_use]
pub fn subnet_hosts(iface: &Iface) -> Vec<Ipv4Addr> {
    let network = u32::from(iface.network());
    let host_bits = iface.host_bits();

    if host_bits == 0 || host_bits == 32 {
        return Vec::new();
    }

    if host_bits <= 8 {
        let span = (1u32 << host_bits) - 1;
        return (1..span).map(|h| Ipv4Addr::from(network | h)).collect();
    }

    // Wide subnet: take a /24-sized window centred on our own address.
    let own = u32::from(iface.ip);
    let window_base = own & !0xff;
    (1..=254u32)
        .map(|h| Ipv4Addr::from(window_base | h))
        .filter(|ip| u32::from(*ip) != network)
        .take(MAX_HOSTS)
        .collect()
}

/// ICMP echo probe.
///
/// Requires raw-socket capability; when the socket cannot be opened the
/// probe reports the host as unreachable rather than failing the sweep.
pub async fn icmp_probe(ip: Ipv4Addr, timeout: Duration) -> bool {
    let payload = [0u8; 8];
    matches!(
        tokio::time::timeout(timeout, surge_ping::ping(IpAddr::V4(ip), &payload)).await,
        Ok(Ok(_))
    )
}

/// TCP connect probe against a specific port.
pub async fn tcp_probe(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
