//! Lanbeam CLI - a LocalSend-compatible LAN transfer node
//!
//! Runs the node: multicast discovery, the peer-facing HTTP/S API, and
//! the loopback management API a UI drives transfers through.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with the persisted configuration
//! lanbeam
//!
//! # One-off overrides
//! lanbeam --alias "Build Box" --port 53317 --pin 1234
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::struct_excessive_bools)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use lanbeam_core::config::{Config, ScanMode};
use lanbeam_core::context::ServiceContext;
use lanbeam_core::protocol::Scheme;
use lanbeam_core::server;

/// Command-line flags; every flag overrides its config counterpart for
/// this run only.
#[derive(Debug, Parser)]
#[command(name = "lanbeam", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Display name on the network
    #[arg(long)]
    alias: Option<String>,

    /// API port
    #[arg(long)]
    port: Option<u16>,

    /// Serve plain HTTP instead of HTTPS
    #[arg(long)]
    http: bool,

    /// Require this PIN on incoming transfers
    #[arg(long)]
    pin: Option<String>,

    /// Directory received files are written under
    #[arg(long, value_name = "DIR")]
    upload_dir: Option<PathBuf>,

    /// Accept transfers without prompting
    #[arg(long)]
    auto_save: Option<bool>,

    /// Discovery strategy
    #[arg(long, value_enum)]
    scan_mode: Option<CliScanMode>,

    /// Bind to one interface instead of all
    #[arg(long)]
    interface: Option<String>,

    /// Publish the reverse-download API
    #[arg(long)]
    download: bool,

    /// Unix socket notifications are delivered to ("" disables)
    #[arg(long, value_name = "PATH")]
    notify_socket: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliScanMode {
    Udp,
    Http,
    Mixed,
}

impl From<CliScanMode> for ScanMode {
    fn from(mode: CliScanMode) -> Self {
        match mode {
            CliScanMode::Udp => Self::Udp,
            CliScanMode::Http => Self::Http,
            CliScanMode::Mixed => Self::Mixed,
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(alias) = &cli.alias {
        config.alias.clone_from(alias);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.http {
        config.protocol = Scheme::Http;
    }
    if let Some(pin) = &cli.pin {
        config.pin.clone_from(pin);
    }
    if let Some(dir) = &cli.upload_dir {
        config.upload_dir.clone_from(dir);
    }
    if let Some(auto_save) = cli.auto_save {
        config.auto_save = auto_save;
    }
    if let Some(mode) = cli.scan_mode {
        config.scan_mode = mode.into();
    }
    if let Some(interface) = &cli.interface {
        config.interface.clone_from(interface);
    }
    if cli.download {
        config.download = true;
    }
    if let Some(socket) = &cli.notify_socket {
        config.notify_socket.clone_from(socket);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    let mut config = Config::load(&config_path)?;
    apply_overrides(&mut config, &cli);

    let context = ServiceContext::initialise(config, config_path)?;
    context.start_background().await;

    {
        let context = context.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                context.trigger_shutdown();
            }
        });
    }

    server::serve(context).await?;
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,lanbeam=info,lanbeam_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "lanbeam",
            "--alias",
            "Build Box",
            "--port",
            "54000",
            "--http",
            "--pin",
            "1234",
            "--scan-mode",
            "udp",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.alias, "Build Box");
        assert_eq!(config.port, 54000);
        assert_eq!(config.protocol, Scheme::Http);
        assert_eq!(config.pin, "1234");
        assert_eq!(config.scan_mode, ScanMode::Udp);
    }

    #[test]
    fn test_defaults_untouched_without_flags() {
        let cli = Cli::parse_from(["lanbeam"]);
        let mut config = Config::default();
        let original_alias = config.alias.clone();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.alias, original_alias);
        assert_eq!(config.protocol, Scheme::Https);
        assert!(!config.download);
    }
}
