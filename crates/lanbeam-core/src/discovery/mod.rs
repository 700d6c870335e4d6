//! Peer discovery engine.
//!
//! Two independent mechanisms feed the peer cache:
//!
//! - **Multicast**: a periodic announce datagram on every eligible
//!   interface, and a listener that records every sender and answers
//!   peers that asked for a reply (HTTP `register`, falling back to a
//!   single `announce=false` datagram).
//! - **Legacy sweep**: a 30-second walk of the subnet for clients that
//!   never multicast (see [`sweep`]).
//!
//! A user-triggered scan-now runs one sweep synchronously at raised
//! concurrency; if the cache is still empty it keeps retrying in the
//! background for the configured window. Finishing a scan-now resets
//! the periodic sweeper's timer so the scheduler is not double-fired.
//!
//! File transfers pause scanning through [`ScanGate`]: a process-wide
//! atomic counter. While it is non-zero every tick skips without
//! resetting its ticker, so transfers never compete with probe bursts
//! for bandwidth.

pub mod multicast;
pub mod peers;
pub mod sweep;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ScanMode;
use crate::notify::Notifier;
use crate::protocol::DeviceDescriptor;
use self::multicast::MulticastSocket;
use self::peers::PeerStore;
use self::sweep::{RateLimiter, Sweeper, SCAN_NOW_CONCURRENCY, SWEEP_CONCURRENCY, SWEEP_ICMP_PPS};

/// Default interval between multicast announces.
pub const ANNOUNCE_PERIOD: Duration = Duration::from_secs(5);

/// Default interval between legacy sweeps.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Discovery lifecycle state, for the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Not started
    Idle,
    /// Loops running
    Running,
    /// Loops running but ticks are skipping (transfer in progress)
    Paused,
    /// Shut down
    Stopped,
}

/// Process-wide transfer/scan coordination counter.
///
/// Components starting a transfer call [`ScanGate::pause`]; finishing,
/// [`ScanGate::resume`]. Scanning is enabled iff no pauses are
/// outstanding. The counter is atomic so pause/resume pairs from any
/// interleaving of tasks balance correctly.
#[derive(Debug, Default)]
pub struct ScanGate {
    pauses: AtomicUsize,
}

impl ScanGate {
    /// Register an in-progress transfer.
    pub fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    /// Unregister a finished transfer.
    pub fn resume(&self) {
        let previous = self.pauses.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "resume without matching pause");
    }

    /// Whether scan ticks should currently skip.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pauses.load(Ordering::SeqCst) > 0
    }
}

/// RAII pause: resumes on drop.
pub struct ScanPause {
    gate: Arc<ScanGate>,
}

impl ScanPause {
    /// Pause scanning until the returned guard drops.
    #[must_use]
    pub fn hold(gate: Arc<ScanGate>) -> Self {
        gate.pause();
        Self { gate }
    }
}

impl Drop for ScanPause {
    fn drop(&mut self) {
        self.gate.resume();
    }
}

/// Tunables for the discovery engine.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Which mechanisms run
    pub mode: ScanMode,
    /// Multicast group
    pub group: Ipv4Addr,
    /// Discovery port (UDP) and peer API port (TCP)
    pub port: u16,
    /// Restrict to one interface, or `None` for all
    pub iface: Option<String>,
    /// Interval between announces
    pub announce_period: Duration,
    /// Interval between sweeps
    pub sweep_period: Duration,
    /// Scan-now background retry window
    pub http_timeout: Duration,
}

/// The discovery engine. One per process.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    descriptor: DeviceDescriptor,
    peers: PeerStore,
    gate: Arc<ScanGate>,
    sweeper: Arc<Sweeper>,
    client: reqwest::Client,
    restart_tx: mpsc::Sender<()>,
    restart_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    shutdown: CancellationToken,
}

impl DiscoveryEngine {
    /// Build an engine around the shared peer cache and notifier.
    #[must_use]
    pub fn new(
        config: DiscoveryConfig,
        descriptor: DeviceDescriptor,
        peers: PeerStore,
        notifier: Notifier,
        gate: Arc<ScanGate>,
        client: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Self {
        let sweeper = Arc::new(Sweeper::new(
            client.clone(),
            descriptor.clone(),
            config.iface.clone(),
            peers.clone(),
            notifier,
        ));
        let (restart_tx, restart_rx) = mpsc::channel(1);
        Self {
            config,
            descriptor,
            peers,
            gate,
            sweeper,
            client,
            restart_tx,
            restart_rx: tokio::sync::Mutex::new(Some(restart_rx)),
            shutdown,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScanState {
        if self.shutdown.is_cancelled() {
            ScanState::Stopped
        } else if self.gate.is_paused() {
            ScanState::Paused
        } else {
            ScanState::Running
        }
    }

    /// The shared pause gate.
    #[must_use]
    pub fn gate(&self) -> Arc<ScanGate> {
        Arc::clone(&self.gate)
    }

    /// Snapshot of discovered peers.
    #[must_use]
    pub fn peers(&self) -> Vec<peers::DiscoveredPeer> {
        self.peers.list()
    }

    /// Record a peer observed outside the scan loops (HTTP register).
    pub async fn record_observation(
        &self,
        descriptor: DeviceDescriptor,
        ip: Ipv4Addr,
        scheme: crate::protocol::Scheme,
    ) {
        self.sweeper.record(descriptor, ip, scheme).await;
    }

    /// Start the loops selected by the configured mode.
    pub async fn start(self: &Arc<Self>) {
        if self.config.mode != ScanMode::Http {
            self.spawn_announce_loop();
            self.spawn_listen_loop();
        }
        if self.config.mode != ScanMode::Udp {
            self.spawn_sweep_loop().await;
        }
    }

    fn spawn_announce_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let socket = match MulticastSocket::bind(
                engine.config.group,
                engine.config.port,
                engine.config.iface.as_deref(),
            ) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("announce loop disabled: {e}");
                    return;
                }
            };
            let announced = engine.descriptor.clone().with_announce(true);
            let mut ticker = tokio::time::interval(engine.config.announce_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if engine.gate.is_paused() {
                            continue;
                        }
                        if let Err(e) = socket.announce(&announced, engine.config.iface.as_deref()).await {
                            tracing::debug!("announce: {e}");
                        }
                    }
                    () = engine.shutdown.cancelled() => break,
                }
            }
        });
    }

    fn spawn_listen_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let socket = match MulticastSocket::bind(
                engine.config.group,
                engine.config.port,
                engine.config.iface.as_deref(),
            ) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("listen loop disabled: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    received = socket.recv_descriptor() => {
                        let Ok((descriptor, source)) = received else { continue };
                        engine.handle_datagram(&socket, descriptor, source).await;
                    }
                    () = engine.shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn handle_datagram(
        &self,
        socket: &MulticastSocket,
        descriptor: DeviceDescriptor,
        source: std::net::SocketAddr,
    ) {
        // Never answer (or record) our own announces.
        if descriptor.fingerprint == self.descriptor.fingerprint
            || descriptor.fingerprint.is_empty()
        {
            return;
        }
        let std::net::SocketAddr::V4(source_v4) = source else {
            return;
        };
        let wants_reply = descriptor.announce;
        let peer_scheme = descriptor.protocol;
        let peer_port = descriptor.port;
        let ip = *source_v4.ip();

        self.sweeper.record(descriptor, ip, peer_scheme).await;

        if wants_reply {
            let url = format!(
                "{peer_scheme}://{ip}:{peer_port}/api/localsend/v2/register"
            );
            let posted = self
                .client
                .post(&url)
                .json(&self.descriptor)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if !posted {
                if let Err(e) = socket.reply_unicast(&self.descriptor, source).await {
                    tracing::debug!("udp reply to {source}: {e}");
                }
            }
        }
    }

    async fn spawn_sweep_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut restart_rx = self
            .restart_rx
            .lock()
            .await
            .take()
            .expect("sweep loop started twice");
        tokio::spawn(async move {
            let limiter = RateLimiter::per_second(SWEEP_ICMP_PPS);
            let mut ticker = tokio::time::interval(engine.config.sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if engine.gate.is_paused() {
                            continue;
                        }
                        engine.sweeper.run(SWEEP_CONCURRENCY, &limiter).await;
                    }
                    signal = restart_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        // A scan-now just completed: push the next
                        // periodic sweep a full period out.
                        ticker.reset();
                    }
                    () = engine.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// User-triggered immediate scan.
    ///
    /// Runs one full sweep synchronously at raised concurrency with no
    /// echo shaping. If the cache is still empty afterwards, a retry
    /// loop continues in the background until a peer appears or the
    /// configured window closes. Either way the periodic sweeper's
    /// timer is reset so it does not fire immediately after.
    pub async fn scan_now(self: &Arc<Self>) -> Vec<peers::DiscoveredPeer> {
        let limiter = RateLimiter::unlimited();
        self.sweeper.run(SCAN_NOW_CONCURRENCY, &limiter).await;

        if self.peers.is_empty() {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + engine.config.http_timeout;
                let limiter = RateLimiter::unlimited();
                while tokio::time::Instant::now() < deadline && engine.peers.is_empty() {
                    tokio::select! {
                        () = tokio::time::sleep(SWEEP_PERIOD) => {}
                        () = engine.shutdown.cancelled() => return,
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    engine.sweeper.run(SCAN_NOW_CONCURRENCY, &limiter).await;
                }
                let _ = engine.restart_tx.try_send(());
            });
        }

        let _ = self.restart_tx.try_send(());
        self.peers.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_balances_any_interleaving() {
        let gate = ScanGate::default();
        assert!(!gate.is_paused());
        gate.pause();
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_gate_n_pauses_n_resumes() {
        let gate = ScanGate::default();
        for _ in 0..7 {
            gate.pause();
        }
        for _ in 0..7 {
            gate.resume();
        }
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_scan_pause_guard_resumes_on_drop() {
        let gate = Arc::new(ScanGate::default());
        {
            let _hold = ScanPause::hold(Arc::clone(&gate));
            assert!(gate.is_paused());
        }
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_gate_is_shared_across_threads() {
        let gate = Arc::new(ScanGate::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        gate.pause();
                        gate.resume();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!gate.is_paused());
    }
}
