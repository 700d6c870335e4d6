//! Configuration management.
//!
//! The node persists a single flat YAML file. Every field is optional
//! on read with a sensible default, so a hand-edited or truncated file
//! never fails to load; unknown keys are ignored rather than corrupting
//! the file. On first run the file is written with defaults (plus the
//! freshly generated TLS identity).
//!
//! CLI flags override their config counterparts in memory only;
//! `PATCH /config` on the management API persists an allow-listed
//! subset back to disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{DeviceDescriptor, DeviceKind, Scheme, DEFAULT_PORT, PROTOCOL_VERSION};

/// Discovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// UDP multicast announce + listen only
    Udp,
    /// Legacy HTTP subnet sweep only
    Http,
    /// Both
    #[default]
    Mixed,
}

/// A favourite peer entry, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteDevice {
    /// Peer fingerprint
    pub favorite_fingerprint: String,
    /// Display alias recorded when the favourite was added
    #[serde(default)]
    pub favorite_alias: String,
}

/// Node configuration, persisted as flat YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Display name on the network
    pub alias: String,
    /// Protocol version string
    pub version: String,
    /// Device model tag
    pub device_model: String,
    /// Device category tag
    pub device_type: DeviceKind,
    /// Persisted fingerprint (kept in sync with the certificate)
    pub fingerprint: String,
    /// API port
    pub port: u16,
    /// API scheme
    pub protocol: Scheme,
    /// Whether the reverse-download API is published
    pub download: bool,
    /// Whether this node replies to discovery messages
    pub announce: bool,
    /// Persisted certificate PEM
    #[serde(rename = "certPEM", skip_serializing_if = "String::is_empty")]
    pub cert_pem: String,
    /// Persisted private key PEM
    #[serde(rename = "keyPEM", skip_serializing_if = "String::is_empty")]
    pub key_pem: String,
    /// Receive PIN; empty disables the PIN gate
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pin: String,
    /// Accept incoming transfers without prompting
    pub auto_save: bool,
    /// When `auto_save` is off, still auto-accept favourites
    pub auto_save_from_favorites: bool,
    /// Favourite peers
    pub favorite_devices: Vec<FavoriteDevice>,
    /// Root directory received files are written under
    pub upload_dir: PathBuf,
    /// Write received files flat instead of one folder per session
    pub do_not_make_session_folder: bool,
    /// Discovery strategy
    pub scan_mode: ScanMode,
    /// Interface to bind outbound dials to, or `all`
    pub interface: String,
    /// Multicast group for UDP discovery
    pub multicast_group: String,
    /// Unix socket path notifications are delivered to; empty disables
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notify_socket: String,
    /// Scan-now HTTP retry window in seconds
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alias: hostname::get().map_or_else(
                |_| "Lanbeam Node".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            version: PROTOCOL_VERSION.to_string(),
            device_model: std::env::consts::OS.to_string(),
            device_type: DeviceKind::Headless,
            fingerprint: String::new(),
            port: DEFAULT_PORT,
            protocol: Scheme::Https,
            download: false,
            announce: true,
            cert_pem: String::new(),
            key_pem: String::new(),
            pin: String::new(),
            auto_save: true,
            auto_save_from_favorites: false,
            favorite_devices: Vec::new(),
            upload_dir: PathBuf::from("uploads"),
            do_not_make_session_folder: false,
            scan_mode: ScanMode::Mixed,
            interface: "all".to_string(),
            multicast_group: "224.0.0.167".to_string(),
            notify_socket: "/tmp/localsend-notify.sock".to_string(),
            http_timeout_secs: 60,
        }
    }
}

/// Allow-listed runtime settings mutable through `PATCH /config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    /// New alias
    pub alias: Option<String>,
    /// New PIN (empty string clears it)
    pub pin: Option<String>,
    /// Toggle auto-save
    pub auto_save: Option<bool>,
    /// Toggle favourites auto-accept
    pub auto_save_from_favorites: Option<bool>,
    /// New upload root
    pub upload_dir: Option<PathBuf>,
    /// Toggle flat-write mode
    pub do_not_make_session_folder: Option<bool>,
    /// New scan mode
    pub scan_mode: Option<ScanMode>,
    /// Toggle the download API
    pub download: Option<bool>,
}

impl Config {
    /// Load from `path`, returning defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("create {}: {e}", parent.display())))?;
            }
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("write {}: {e}", path.display())))
    }

    /// Default configuration file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("io", "lanbeam", "Lanbeam").map_or_else(
            || PathBuf::from("config.yaml"),
            |dirs| dirs.config_dir().join("config.yaml"),
        )
    }

    /// This node's identity as sent on every discovery/handshake path.
    #[must_use]
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            alias: self.alias.clone(),
            version: self.version.clone(),
            device_model: (!self.device_model.is_empty()).then(|| self.device_model.clone()),
            device_type: self.device_type,
            fingerprint: self.fingerprint.clone(),
            port: self.port,
            protocol: self.protocol,
            download: self.download,
            announce: self.announce,
        }
    }

    /// Apply an allow-listed patch in memory.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) {
        if let Some(alias) = &patch.alias {
            self.alias.clone_from(alias);
        }
        if let Some(pin) = &patch.pin {
            self.pin.clone_from(pin);
        }
        if let Some(auto_save) = patch.auto_save {
            self.auto_save = auto_save;
        }
        if let Some(from_favorites) = patch.auto_save_from_favorites {
            self.auto_save_from_favorites = from_favorites;
        }
        if let Some(dir) = &patch.upload_dir {
            self.upload_dir.clone_from(dir);
        }
        if let Some(flat) = patch.do_not_make_session_folder {
            self.do_not_make_session_folder = flat;
        }
        if let Some(mode) = patch.scan_mode {
            self.scan_mode = mode;
        }
        if let Some(download) = patch.download {
            self.download = download;
        }
    }

    /// Fingerprints of the favourite peers, re-read from disk.
    ///
    /// The file is read live so edits made by other tools are honoured
    /// on the very next transfer.
    #[must_use]
    pub fn favorites_on_disk(path: &Path) -> HashSet<String> {
        Self::load(path).map_or_else(
            |e| {
                tracing::warn!("favourites unreadable: {e}");
                HashSet::new()
            },
            |config| {
                config
                    .favorite_devices
                    .into_iter()
                    .map(|f| f.favorite_fingerprint)
                    .collect()
            },
        )
    }
}
