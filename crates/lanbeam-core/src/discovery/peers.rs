//! Discovered-peer cache.
//!
//! Peers are keyed by fingerprint and expire five minutes after the
//! last announce or register that refreshed them. The cache reports
//! whether an observation was new, a change of address/alias/port, or
//! a plain refresh, so the engine can notify UIs on the first two.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::protocol::{DeviceDescriptor, Scheme};

/// How long a peer stays listed without being re-observed.
pub const PEER_TTL: Duration = Duration::from_secs(300);

/// A peer we can reach: identity plus observed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// The peer's self-reported identity
    pub descriptor: DeviceDescriptor,
    /// IPv4 address the peer was observed at
    pub ip: Ipv4Addr,
}

impl DiscoveredPeer {
    /// Base URL of the peer's API.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.descriptor.protocol, self.ip, self.descriptor.port
        )
    }

    /// Base URL with the scheme overridden.
    #[must_use]
    pub fn base_url_with(&self, scheme: Scheme) -> String {
        format!("{}://{}:{}", scheme, self.ip, self.descriptor.port)
    }
}

/// Outcome of recording an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// First sighting of this fingerprint
    New,
    /// Known fingerprint with changed alias, address, or port
    Updated,
    /// Known fingerprint, nothing changed (TTL refreshed)
    Refreshed,
}

/// Fingerprint-keyed cache of reachable peers.
#[derive(Clone)]
pub struct PeerStore {
    peers: TtlCache<String, DiscoveredPeer>,
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStore {
    /// Create an empty store with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: TtlCache::new(PEER_TTL),
        }
    }

    /// Record an observation, refreshing the TTL.
    pub fn observe(&self, descriptor: DeviceDescriptor, ip: Ipv4Addr) -> PeerEvent {
        let fingerprint = descriptor.fingerprint.clone();
        let event = match self.peers.get(&fingerprint) {
            None => PeerEvent::New,
            Some(known)
                if known.ip != ip
                    || known.descriptor.alias != descriptor.alias
                    || known.descriptor.port != descriptor.port =>
            {
                PeerEvent::Updated
            }
            Some(_) => PeerEvent::Refreshed,
        };
        self.peers.set(fingerprint, DiscoveredPeer { descriptor, ip });
        event
    }

    /// Look up a peer by fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<DiscoveredPeer> {
        self.peers.get(&fingerprint.to_string())
    }

    /// Snapshot of every live peer.
    #[must_use]
    pub fn list(&self) -> Vec<DiscoveredPeer> {
        let mut out = Vec::new();
        self.peers.range(|_, peer| out.push(peer.clone()));
        out
    }

    /// Number of live peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is currently listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Eagerly collect expired peers.
    pub fn sweep(&self) {
        self.peers.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceKind;

    fn descriptor(alias: &str, fingerprint: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            alias: alias.to_string(),
            fingerprint: fingerprint.to_string(),
            device_type: DeviceKind::Desktop,
            ..DeviceDescriptor::default()
        }
    }

    #[test]
    fn test_first_sighting_is_new() {
        let store = PeerStore::new();
        let event = store.observe(descriptor("A", "fp1"), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(event, PeerEvent::New);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_same_observation_is_refresh() {
        let store = PeerStore::new();
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        store.observe(descriptor("A", "fp1"), ip);
        let event = store.observe(descriptor("A", "fp1"), ip);
        assert_eq!(event, PeerEvent::Refreshed);
    }

    #[test]
    fn test_address_change_is_update() {
        let store = PeerStore::new();
        store.observe(descriptor("A", "fp1"), Ipv4Addr::new(192, 168, 1, 2));
        let event = store.observe(descriptor("A", "fp1"), Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(event, PeerEvent::Updated);
        assert_eq!(store.get("fp1").unwrap().ip, Ipv4Addr::new(192, 168, 1, 9));
    }

    #[test]
    fn test_alias_change_is_update() {
        let store = PeerStore::new();
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        store.observe(descriptor("A", "fp1"), ip);
        let event = store.observe(descriptor("B", "fp1"), ip);
        assert_eq!(event, PeerEvent::Updated);
    }

    #[test]
    fn test_base_url_uses_peer_scheme() {
        let mut desc = descriptor("A", "fp1");
        desc.protocol = Scheme::Http;
        desc.port = 53317;
        let peer = DiscoveredPeer {
            descriptor: desc,
            ip: Ipv4Addr::new(10, 0, 0, 7),
        };
        assert_eq!(peer.base_url(), "http://10.0.0.7:53317");
        assert_eq!(peer.base_url_with(Scheme::Https), "https://10.0.0.7:53317");
    }
}
