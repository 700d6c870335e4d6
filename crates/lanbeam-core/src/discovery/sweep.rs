//! Legacy HTTP sweep scan.
//!
//! Some clients never send multicast; they are found by walking the
//! subnet and POSTing the self descriptor to every address that
//! answers an ICMP echo. HTTPS is tried first and downgraded to plain
//! HTTP when the peer's listener resets the handshake; whichever
//! scheme produced a descriptor becomes the peer's recorded protocol.
//!
//! Probe traffic is shaped twice: a semaphore-style concurrency bound
//! on in-flight hosts, and a packets-per-second limiter on the echoes
//! so a background sweep never floods the segment. Scan-now lifts
//! both.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use super::peers::{PeerEvent, PeerStore};
use crate::netutil::{self, Iface};
use crate::notify::{Notification, NotifyKind, Notifier};
use crate::protocol::{DeviceDescriptor, Scheme};

/// In-flight host bound for the periodic background sweep.
pub const SWEEP_CONCURRENCY: usize = 24;

/// In-flight host bound for a user-triggered scan-now.
pub const SCAN_NOW_CONCURRENCY: usize = 256;

/// Echo budget for the background sweep, packets per second.
pub const SWEEP_ICMP_PPS: u32 = 30;

/// HTTP timeout on sweep register calls.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum-interval packet shaper.
///
/// `None` interval means unshaped (scan-now).
pub struct RateLimiter {
    interval: Option<Duration>,
    next: tokio::sync::Mutex<tokio::time::Instant>,
}

impl RateLimiter {
    /// Shaper allowing `pps` packets per second.
    #[must_use]
    pub fn per_second(pps: u32) -> Self {
        Self {
            interval: (pps > 0).then(|| Duration::from_secs(1) / pps),
            next: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Unshaped limiter.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            interval: None,
            next: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Wait for the next send slot.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let deadline = {
            let mut next = self.next.lock().await;
            let now = tokio::time::Instant::now();
            let deadline = (*next).max(now);
            *next = deadline + interval;
            deadline
        };
        tokio::time::sleep_until(deadline).await;
    }
}

type HostCacheKey = Vec<(String, Ipv4Addr, Ipv4Addr)>;

/// Sweep scanner over the local subnets.
pub struct Sweeper {
    client: reqwest::Client,
    descriptor: DeviceDescriptor,
    iface_name: Option<String>,
    peers: PeerStore,
    notifier: Notifier,
    host_cache: Mutex<Option<(HostCacheKey, Vec<Ipv4Addr>)>>,
}

impl Sweeper {
    /// Create a sweeper.
    ///
    /// The client must already accept self-signed certificates; peers
    /// on the sweep path always present them.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        descriptor: DeviceDescriptor,
        iface_name: Option<String>,
        peers: PeerStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            client,
            descriptor,
            iface_name,
            peers,
            notifier,
            host_cache: Mutex::new(None),
        }
    }

    /// Candidate hosts across eligible interfaces, minus our own
    /// addresses. Cached against the observed interface configuration.
    fn candidate_hosts(&self) -> Vec<Ipv4Addr> {
        let Ok(ifaces) = netutil::eligible_interfaces(self.iface_name.as_deref()) else {
            return Vec::new();
        };
        let key: HostCacheKey = ifaces
            .iter()
            .map(|i| (i.name.clone(), i.ip, i.netmask))
            .collect();

        {
            let cache = self.host_cache.lock().expect("host cache poisoned");
            if let Some((cached_key, hosts)) = cache.as_ref() {
                if *cached_key == key {
                    return hosts.clone();
                }
            }
        }

        let local = netutil::local_ipv4s();
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        for iface in &ifaces {
            for host in netutil::subnet_hosts(iface) {
                if !local.contains(&host) && seen.insert(host) {
                    hosts.push(host);
                }
            }
        }

        let mut cache = self.host_cache.lock().expect("host cache poisoned");
        *cache = Some((key, hosts.clone()));
        hosts
    }

    /// Run one full sweep.
    ///
    /// Returns the number of peers recorded. Transport failures are
    /// silent by design; only the aggregate is interesting.
    pub async fn run(&self, concurrency: usize, limiter: &RateLimiter) -> usize {
        let hosts = self.candidate_hosts();
        if hosts.is_empty() {
            return 0;
        }
        tracing::debug!("sweeping {} hosts", hosts.len());

        let found = Arc::new(Mutex::new(0usize));
        futures::stream::iter(hosts)
            .for_each_concurrent(concurrency, |host| {
                let found = Arc::clone(&found);
                async move {
                    limiter.acquire().await;
                    if !netutil::icmp_probe(host, netutil::ICMP_TIMEOUT).await {
                        return;
                    }
                    if let Some((descriptor, scheme)) = self.register_at(host).await {
                        self.record(descriptor, host, scheme).await;
                        *found.lock().expect("counter poisoned") += 1;
                    }
                }
            })
            .await;

        let total = *found.lock().expect("counter poisoned");
        tracing::debug!("sweep recorded {total} peers");
        total
    }

    /// POST the self descriptor to one host, HTTPS first then HTTP.
    async fn register_at(&self, host: Ipv4Addr) -> Option<(DeviceDescriptor, Scheme)> {
        for scheme in [Scheme::Https, Scheme::Http] {
            let url = format!(
                "{scheme}://{host}:{}/api/localsend/v2/register",
                self.descriptor.port
            );
            let response = self
                .client
                .post(&url)
                .timeout(REGISTER_TIMEOUT)
                .json(&self.descriptor)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    match response.json::<DeviceDescriptor>().await {
                        Ok(descriptor) => return Some((descriptor, scheme)),
                        Err(e) => {
                            tracing::trace!("register body from {host}: {e}");
                            return None;
                        }
                    }
                }
                Ok(response) => {
                    tracing::trace!("register at {url}: {}", response.status());
                    return None;
                }
                // Handshake reset on a plain-HTTP listener: downgrade.
                Err(e) => {
                    tracing::trace!("register at {url}: {e}");
                }
            }
        }
        None
    }

    /// The notifier peers events are fanned out on.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Record an observation (from any discovery path), notifying UIs
    /// on first sight and on change.
    pub async fn record(&self, mut descriptor: DeviceDescriptor, ip: Ipv4Addr, scheme: Scheme) {
        if descriptor.fingerprint == self.descriptor.fingerprint {
            return;
        }
        descriptor.protocol = scheme;
        let alias = descriptor.alias.clone();
        let fingerprint = descriptor.fingerprint.clone();
        match self.peers.observe(descriptor, ip) {
            PeerEvent::New => {
                let note = Notification::device(
                    NotifyKind::DeviceDiscovered,
                    &alias,
                    &ip.to_string(),
                    &fingerprint,
                );
                let _ = self.notifier.send(&note).await;
            }
            PeerEvent::Updated => {
                let note = Notification::device(
                    NotifyKind::DeviceUpdated,
                    &alias,
                    &ip.to_string(),
                    &fingerprint,
                );
                let _ = self.notifier.send(&note).await;
            }
            PeerEvent::Refreshed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_spaces_sends() {
        tokio::time::pause();
        let limiter = RateLimiter::per_second(10);
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // 5 acquisitions at 10 pps: at least 400ms of virtual time.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_unlimited_limiter_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = std::time::Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_host_cache_reused_for_same_config() {
        let notifier = Notifier::new(false, None);
        let sweeper = Sweeper::new(
            reqwest::Client::new(),
            DeviceDescriptor::default(),
            None,
            PeerStore::new(),
            notifier,
        );
        let first = sweeper.candidate_hosts();
        let second = sweeper.candidate_hosts();
        assert_eq!(first, second);
    }
}
