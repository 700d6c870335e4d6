//! UDP multicast announce and listen.
//!
//! Announcing sends the self descriptor (with `announce=true`) to the
//! group on every eligible interface. Listening joins the group on the
//! same interfaces and records every sender; senders that asked for a
//! reply get the self descriptor back, over HTTP `register` when
//! possible and as a single `announce=false` datagram otherwise.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::netutil::{eligible_interfaces, Iface};
use crate::protocol::DeviceDescriptor;

/// Maximum datagram size we accept for a descriptor.
const DATAGRAM_MAX: usize = 4096;

/// Multicast send/receive endpoints for discovery datagrams.
pub struct MulticastSocket {
    group: Ipv4Addr,
    port: u16,
    recv: Arc<UdpSocket>,
}

impl MulticastSocket {
    /// Bind the group port and join on every eligible interface.
    ///
    /// Interfaces that refuse the join (typically transient address
    /// states) are skipped with a log line rather than failing setup.
    pub fn bind(group: Ipv4Addr, port: u16, iface_name: Option<&str>) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let mut joined = 0usize;
        for iface in eligible_interfaces(iface_name)? {
            match socket.join_multicast_v4(&group, &iface.ip) {
                Ok(()) => joined += 1,
                Err(e) => {
                    tracing::debug!("join {group} on {}: {e}", iface.name);
                }
            }
        }
        if joined == 0 {
            return Err(Error::NoInterface);
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let recv = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            group,
            port,
            recv: Arc::new(recv),
        })
    }

    /// Receive one descriptor datagram.
    pub async fn recv_descriptor(&self) -> Result<(DeviceDescriptor, SocketAddr)> {
        let mut buf = [0u8; DATAGRAM_MAX];
        loop {
            let (len, source) = self.recv.recv_from(&mut buf).await?;
            match serde_json::from_slice::<DeviceDescriptor>(&buf[..len]) {
                Ok(descriptor) => return Ok((descriptor, source)),
                Err(e) => {
                    tracing::trace!("undecodable datagram from {source}: {e}");
                }
            }
        }
    }

    /// Send the descriptor to the group once per eligible interface.
    ///
    /// `EADDRNOTAVAIL` on an interface (its address went away between
    /// enumeration and send) skips that interface.
    pub async fn announce(
        &self,
        descriptor: &DeviceDescriptor,
        iface_name: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(descriptor)?;
        let target = SocketAddrV4::new(self.group, self.port);
        let mut sent = 0usize;

        for iface in eligible_interfaces(iface_name)? {
            match send_on_interface(&iface, &payload, target).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::debug!("announce on {}: {e}", iface.name);
                }
            }
        }
        if sent == 0 {
            return Err(Error::Transport("no interface accepted announce".into()));
        }
        Ok(())
    }

    /// Send a single unicast reply datagram (the HTTP-fallback path).
    pub async fn reply_unicast(
        &self,
        descriptor: &DeviceDescriptor,
        target: SocketAddr,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&descriptor.clone().with_announce(false))?;
        self.recv.send_to(&payload, target).await?;
        Ok(())
    }
}

async fn send_on_interface(
    iface: &Iface,
    payload: &[u8],
    target: SocketAddrV4,
) -> std::io::Result<()> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_if_v4(&iface.ip)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.bind(&SocketAddrV4::new(iface.ip, 0).into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;
    socket.send_to(payload, SocketAddr::V4(target)).await?;
    Ok(())
}
