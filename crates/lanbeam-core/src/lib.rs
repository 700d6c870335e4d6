//! # Lanbeam Core Library
//!
//! `lanbeam-core` implements a peer-to-peer LAN file-transfer node
//! speaking the LocalSend v2 protocol (accepting legacy v1). Each node
//! is simultaneously a sender and a receiver: it announces itself over
//! UDP multicast, sweeps the subnet for legacy peers, negotiates
//! per-file transfer sessions behind PIN and confirmation gates,
//! streams bytes over HTTP/HTTPS with hash and size verification, and
//! publishes files for peers to pull in reverse-download mode. A
//! loopback-only management API lets a UI drive and observe all of it.
//!
//! ## Modules
//!
//! - [`cache`] - TTL-bounded key/value maps backing every session store
//! - [`client`] - Sending-side protocol client
//! - [`config`] - YAML configuration and device identity
//! - [`context`] - The process-wide [`context::ServiceContext`]
//! - [`discovery`] - Multicast announce/listen and the legacy sweep
//! - [`identity`] - Self-signed TLS identity and fingerprints
//! - [`netutil`] - Interface enumeration and liveness probes
//! - [`notify`] - Notification fan-out (IPC socket + WebSocket)
//! - [`protocol`] - LocalSend v2 wire types
//! - [`receive`] - Prepare-upload gates and the verified write path
//! - [`server`] - HTTP/S routes and middleware
//! - [`session`] - Upload/outgoing session state
//! - [`share`] - Reverse-download share sessions
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanbeam_core::{config::Config, context::ServiceContext, server};
//!
//! let path = Config::default_path();
//! let config = Config::load(&path)?;
//! let context = ServiceContext::initialise(config, path)?;
//! context.start_background().await;
//! server::serve(context).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod netutil;
pub mod notify;
pub mod protocol;
pub mod receive;
pub mod server;
pub mod session;
pub mod share;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
