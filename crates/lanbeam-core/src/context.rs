//! Process-wide service context.
//!
//! All mutable shared state (config, caches, peers, sessions) lives in
//! one [`ServiceContext`] value constructed at startup and threaded
//! through every component; nothing is a global. The notifier is
//! passed down as a collaborator so upload code never depends on the
//! delivery transport.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{build_http_client, SenderClient};
use crate::config::Config;
use crate::discovery::peers::PeerStore;
use crate::discovery::{DiscoveryConfig, DiscoveryEngine, ScanGate, ANNOUNCE_PERIOD, SWEEP_PERIOD};
use crate::error::{Error, Result};
use crate::identity::{random_fingerprint, TlsIdentity};
use crate::notify::Notifier;
use crate::protocol::Scheme;
use crate::receive::Receiver;
use crate::session::{ConfirmRegistry, OutgoingStore, UploadStore};
use crate::share::ShareEngine;

/// Period of the low-frequency expiry sweepers.
const SWEEPER_PERIOD: Duration = Duration::from_secs(15);

/// Everything a running node shares between its components.
pub struct ServiceContext {
    /// Mutable runtime configuration
    pub config: Arc<RwLock<Config>>,
    /// Where the configuration persists
    pub config_path: PathBuf,
    /// TLS identity (None when serving plain HTTP)
    pub identity: Option<TlsIdentity>,
    /// Discovered peers
    pub peers: PeerStore,
    /// Sessions we are receiving
    pub uploads: UploadStore,
    /// Sessions we are sending
    pub outgoing: OutgoingStore,
    /// Accept/reject rendezvous channels
    pub confirms: ConfirmRegistry,
    /// Notification fan-out
    pub notifier: Notifier,
    /// Prepare-upload gate keeper
    pub receiver: Receiver,
    /// Reverse-download engine
    pub share: ShareEngine,
    /// Sending-side protocol client
    pub sender: SenderClient,
    /// Discovery engine
    pub discovery: Arc<DiscoveryEngine>,
    /// Scan pause counter
    pub gate: Arc<ScanGate>,
    /// Process shutdown scope
    pub shutdown: CancellationToken,
}

impl ServiceContext {
    /// Initialise the full context from a loaded configuration.
    ///
    /// Resolves the TLS identity (reusing the persisted PEM pair when
    /// valid), fixes up the fingerprint, and persists the config back
    /// when anything changed.
    pub fn initialise(mut config: Config, config_path: PathBuf) -> Result<Arc<Self>> {
        let mut dirty = false;

        let identity = if config.protocol == Scheme::Https {
            let persisted = (!config.cert_pem.is_empty() && !config.key_pem.is_empty())
                .then(|| (config.cert_pem.clone(), config.key_pem.clone()));
            let (identity, generated) = TlsIdentity::load_or_generate(
                persisted.as_ref().map(|(c, k)| (c.as_str(), k.as_str())),
            )?;
            if generated || config.fingerprint != identity.fingerprint {
                config.cert_pem.clone_from(&identity.cert_pem);
                config.key_pem.clone_from(&identity.key_pem);
                config.fingerprint.clone_from(&identity.fingerprint);
                dirty = true;
            }
            Some(identity)
        } else {
            if config.fingerprint.is_empty() {
                config.fingerprint = random_fingerprint();
                dirty = true;
            }
            None
        };

        if dirty || !config_path.exists() {
            config.save(&config_path)?;
        }

        let bind_addr = crate::netutil::outgoing_bind_addr(&config.interface)?;
        let http = build_http_client(bind_addr)?;

        let descriptor = config.descriptor();
        let multicast_group = config
            .multicast_group
            .parse()
            .map_err(|_| Error::Config(format!("multicast group: {}", config.multicast_group)))?;
        let iface = (config.interface != "all" && !config.interface.is_empty())
            .then(|| config.interface.clone());
        let discovery_config = DiscoveryConfig {
            mode: config.scan_mode,
            group: multicast_group,
            port: config.port,
            iface,
            announce_period: ANNOUNCE_PERIOD,
            sweep_period: SWEEP_PERIOD,
            http_timeout: Duration::from_secs(config.http_timeout_secs),
        };

        let notify_socket =
            (!config.notify_socket.is_empty()).then(|| PathBuf::from(&config.notify_socket));
        let notifier = Notifier::new(true, notify_socket);

        let shared_config = Arc::new(RwLock::new(config));
        let peers = PeerStore::new();
        let uploads = UploadStore::new();
        let outgoing = OutgoingStore::new();
        let confirms = ConfirmRegistry::default();
        let gate = Arc::new(ScanGate::default());
        let shutdown = CancellationToken::new();

        let receiver = Receiver::new(
            Arc::clone(&shared_config),
            config_path.clone(),
            uploads.clone(),
            confirms.clone(),
            notifier.clone(),
        );
        let share = ShareEngine::new(
            Arc::clone(&shared_config),
            confirms.clone(),
            notifier.clone(),
        );
        let sender = SenderClient::new(http.clone(), descriptor.clone());
        let discovery = Arc::new(DiscoveryEngine::new(
            discovery_config,
            descriptor,
            peers.clone(),
            notifier.clone(),
            Arc::clone(&gate),
            http,
            shutdown.clone(),
        ));

        Ok(Arc::new(Self {
            config: shared_config,
            config_path,
            identity,
            peers,
            uploads,
            outgoing,
            confirms,
            notifier,
            receiver,
            share,
            sender,
            discovery,
            gate,
            shutdown,
        }))
    }

    /// Start the background machinery: discovery loops and sweepers.
    pub async fn start_background(self: &Arc<Self>) {
        self.discovery.start().await;
        self.uploads.spawn_sweeper(SWEEPER_PERIOD);

        let peers = self.peers.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEPER_PERIOD * 4);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => peers.sweep(),
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Persist the current configuration.
    pub fn save_config(&self) -> Result<()> {
        let config = self.config.read().expect("config lock poisoned").clone();
        config.save(&self.config_path)
    }

    /// Signal every session and loop to stop.
    pub fn trigger_shutdown(&self) {
        self.uploads.cancel_all();
        self.outgoing.cancel_all();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialise_generates_and_persists_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let context = ServiceContext::initialise(Config::default(), path.clone()).expect("init");
        assert!(context.identity.is_some());

        let persisted = Config::load(&path).expect("reload");
        assert!(!persisted.cert_pem.is_empty());
        assert!(!persisted.key_pem.is_empty());
        assert_eq!(persisted.fingerprint.len(), 32);

        // Second start reuses the identity.
        let second = ServiceContext::initialise(persisted.clone(), path).expect("init again");
        assert_eq!(
            second.identity.as_ref().unwrap().fingerprint,
            persisted.fingerprint
        );
    }

    #[test]
    fn test_http_mode_gets_random_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.protocol = Scheme::Http;

        let context = ServiceContext::initialise(config, path).expect("init");
        assert!(context.identity.is_none());
        let fingerprint = {
            let config = context.config.read().unwrap();
            config.fingerprint.clone()
        };
        assert_eq!(fingerprint.len(), 32);
    }
}
