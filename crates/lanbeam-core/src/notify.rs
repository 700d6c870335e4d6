//! Notification fan-out.
//!
//! Transfer progress and confirmation prompts are pushed to whatever
//! UI is attached: a local IPC socket (length-prefixed JSON over a
//! Unix socket) and/or WebSocket clients registered on the management
//! API. Sends are fire-and-forget; a UI that is not listening never
//! blocks a transfer.
//!
//! Payloads are size-bounded at the source: anything over 32 KiB after
//! serialisation is rejected, and the per-type truncation rules below
//! keep file lists under that bound long before it is hit.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::FileInfo;

/// Serialised payload ceiling.
pub const MAX_PAYLOAD: usize = 32 * 1024;

/// File-list cap on confirmation prompts.
const CONFIRM_LIST_CAP: usize = 20;

/// File-list cap on end-of-transfer summaries.
const END_LIST_CAP: usize = 10;

/// Character cap on path strings.
const PATH_CAP: usize = 256;

/// Character cap on file-name strings.
const NAME_CAP: usize = 128;

/// IPC connect/read/write timeout.
const IPC_TIMEOUT: Duration = Duration::from_secs(3);

/// The closed set of notification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    /// A sender attempted prepare-upload without the required PIN
    PinRequired,
    /// An incoming transfer awaits the user's accept/reject decision
    ConfirmRecv,
    /// A download client awaits the publisher's confirmation
    ConfirmDownload,
    /// A text message arrived (never written to disk)
    TextReceived,
    /// First file of a session started persisting
    UploadStart,
    /// A file finished (more remain)
    UploadProgress,
    /// All files of a session are accounted for
    UploadEnd,
    /// A session was cancelled
    UploadCancelled,
    /// A new peer appeared
    DeviceDiscovered,
    /// A known peer changed alias/IP/port
    DeviceUpdated,
    /// Informational message
    Info,
}

/// Typed payload union; flattened into the wire `data` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyPayload {
    /// `confirm_recv` / `confirm_download` prompt
    Confirm {
        /// Session awaiting the decision
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Peer alias (or client key for downloads)
        sender: String,
        /// Truncated file-name list
        files: Vec<String>,
        /// True total, which may exceed `files.len()`
        #[serde(rename = "totalFiles")]
        total_files: usize,
    },
    /// `text_received` content
    Text {
        /// Session the text arrived in
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Sender alias
        sender: String,
        /// The message text
        text: String,
    },
    /// `upload_start` / `upload_progress` bookkeeping
    Progress {
        /// Session
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Files not yet finished
        remaining: usize,
        /// Files finished successfully so far
        #[serde(rename = "successFiles")]
        success_files: usize,
        /// Files failed so far
        #[serde(rename = "failedFiles")]
        failed_files: usize,
    },
    /// `upload_end` summary
    End {
        /// Session
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Files finished successfully
        #[serde(rename = "successFiles")]
        success_files: usize,
        /// Files failed
        #[serde(rename = "failedFiles")]
        failed_files: usize,
        /// Ids of failed files (truncated)
        #[serde(rename = "failedFileIds")]
        failed_file_ids: Vec<String>,
        /// Declared file names (truncated)
        files: Vec<String>,
        /// Names actually written (truncated)
        #[serde(rename = "savedFileNames")]
        saved_file_names: Vec<String>,
        /// Absolute save paths (truncated)
        #[serde(rename = "savePaths")]
        save_paths: Vec<String>,
    },
    /// Peer cache events
    Device {
        /// Peer alias
        alias: String,
        /// Peer address
        ip: String,
        /// Peer fingerprint
        fingerprint: String,
    },
    /// Bare session reference (`upload_cancelled`, `pin_required`)
    Session {
        /// Session
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Free-form info
    Message {
        /// The message
        message: String,
    },
}

/// A notification as delivered to UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Message type
    #[serde(rename = "type")]
    pub kind: NotifyKind,
    /// Short title
    pub title: String,
    /// Human-readable body
    pub message: String,
    /// Typed payload
    pub data: NotifyPayload,
    /// Marks text messages so UIs can render them inline
    #[serde(rename = "textOnly")]
    pub text_only: bool,
}

fn ellipsize(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let truncated: String = s.chars().take(cap.saturating_sub(1)).collect();
    format!("{truncated}\u{2026}")
}

fn truncated_names(files: &[&FileInfo], cap: usize) -> Vec<String> {
    files
        .iter()
        .take(cap)
        .map(|f| ellipsize(&f.file_name, NAME_CAP))
        .collect()
}

impl Notification {
    /// Build a `confirm_recv` prompt with the list truncation applied.
    #[must_use]
    pub fn confirm_recv(session_id: &str, sender: &str, files: &[&FileInfo]) -> Self {
        Self {
            kind: NotifyKind::ConfirmRecv,
            title: "Incoming files".to_string(),
            message: format!("{sender} wants to send {} file(s)", files.len()),
            data: NotifyPayload::Confirm {
                session_id: session_id.to_string(),
                sender: sender.to_string(),
                files: truncated_names(files, CONFIRM_LIST_CAP),
                total_files: files.len(),
            },
            text_only: false,
        }
    }

    /// Build a `confirm_download` prompt.
    #[must_use]
    pub fn confirm_download(session_id: &str, client_key: &str, files: &[&FileInfo]) -> Self {
        Self {
            kind: NotifyKind::ConfirmDownload,
            title: "Download request".to_string(),
            message: format!("{client_key} wants to fetch {} file(s)", files.len()),
            data: NotifyPayload::Confirm {
                session_id: session_id.to_string(),
                sender: client_key.to_string(),
                files: truncated_names(files, CONFIRM_LIST_CAP),
                total_files: files.len(),
            },
            text_only: false,
        }
    }

    /// Build a `pin_required` notification.
    #[must_use]
    pub fn pin_required(session_id: &str, sender: &str) -> Self {
        Self {
            kind: NotifyKind::PinRequired,
            title: "PIN required".to_string(),
            message: format!("{sender} attempted a transfer without the PIN"),
            data: NotifyPayload::Session {
                session_id: session_id.to_string(),
            },
            text_only: false,
        }
    }

    /// Build a `text_received` notification carrying the message inline.
    #[must_use]
    pub fn text_received(session_id: &str, sender: &str, text: &str) -> Self {
        Self {
            kind: NotifyKind::TextReceived,
            title: format!("Message from {sender}"),
            message: ellipsize(text, NAME_CAP),
            data: NotifyPayload::Text {
                session_id: session_id.to_string(),
                sender: sender.to_string(),
                text: text.to_string(),
            },
            text_only: true,
        }
    }

    /// Build an `upload_start` notification.
    #[must_use]
    pub fn upload_start(session_id: &str, total_files: usize) -> Self {
        Self {
            kind: NotifyKind::UploadStart,
            title: "Receiving".to_string(),
            message: format!("receiving {total_files} file(s)"),
            data: NotifyPayload::Progress {
                session_id: session_id.to_string(),
                remaining: total_files,
                success_files: 0,
                failed_files: 0,
            },
            text_only: false,
        }
    }

    /// Build an `upload_progress` notification.
    #[must_use]
    pub fn upload_progress(
        session_id: &str,
        remaining: usize,
        success_files: usize,
        failed_files: usize,
    ) -> Self {
        Self {
            kind: NotifyKind::UploadProgress,
            title: "Receiving".to_string(),
            message: format!("{remaining} file(s) remaining"),
            data: NotifyPayload::Progress {
                session_id: session_id.to_string(),
                remaining,
                success_files,
                failed_files,
            },
            text_only: false,
        }
    }

    /// Build the single `upload_end` summary with all list caps applied.
    #[must_use]
    pub fn upload_end(
        session_id: &str,
        success_files: usize,
        failed_files: usize,
        failed_file_ids: &[String],
        file_names: &[String],
        saved_file_names: &[String],
        save_paths: &[String],
    ) -> Self {
        let cap_names = |names: &[String]| -> Vec<String> {
            names
                .iter()
                .take(END_LIST_CAP)
                .map(|n| ellipsize(n, NAME_CAP))
                .collect()
        };
        Self {
            kind: NotifyKind::UploadEnd,
            title: "Transfer finished".to_string(),
            message: format!("{success_files} received, {failed_files} failed"),
            data: NotifyPayload::End {
                session_id: session_id.to_string(),
                success_files,
                failed_files,
                failed_file_ids: failed_file_ids
                    .iter()
                    .take(END_LIST_CAP)
                    .cloned()
                    .collect(),
                files: cap_names(file_names),
                saved_file_names: cap_names(saved_file_names),
                save_paths: save_paths
                    .iter()
                    .take(END_LIST_CAP)
                    .map(|p| ellipsize(p, PATH_CAP))
                    .collect(),
            },
            text_only: false,
        }
    }

    /// Build an `upload_cancelled` notification.
    #[must_use]
    pub fn upload_cancelled(session_id: &str) -> Self {
        Self {
            kind: NotifyKind::UploadCancelled,
            title: "Transfer cancelled".to_string(),
            message: format!("session {session_id} cancelled"),
            data: NotifyPayload::Session {
                session_id: session_id.to_string(),
            },
            text_only: false,
        }
    }

    /// Build a `device_discovered` / `device_updated` notification.
    #[must_use]
    pub fn device(kind: NotifyKind, alias: &str, ip: &str, fingerprint: &str) -> Self {
        Self {
            kind,
            title: match kind {
                NotifyKind::DeviceUpdated => "Device updated".to_string(),
                _ => "Device discovered".to_string(),
            },
            message: format!("{alias} at {ip}"),
            data: NotifyPayload::Device {
                alias: alias.to_string(),
                ip: ip.to_string(),
                fingerprint: fingerprint.to_string(),
            },
            text_only: false,
        }
    }
}

/// Registry of WebSocket clients receiving the fan-out.
#[derive(Debug, Clone, Default)]
pub struct WsHub {
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl WsHub {
    /// Register a client; the returned receiver yields serialised
    /// notifications until the hub drops the sender on write failure.
    #[must_use]
    pub fn register(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().expect("hub lock poisoned").push(tx);
        rx
    }

    /// Marshal once, write to all, drop the dead.
    pub fn broadcast(&self, serialised: &str) {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        clients.retain(|tx| tx.send(serialised.to_string()).is_ok());
    }

    /// Number of live clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("hub lock poisoned").len()
    }
}

/// Notification dispatcher.
///
/// Owns the IPC socket path and the WebSocket hub; every component
/// that needs to notify holds a clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    enabled: bool,
    socket_path: Option<PathBuf>,
    hub: WsHub,
}

impl Notifier {
    /// Create a dispatcher.
    ///
    /// `socket_path` of `None` (or an empty configured path) disables
    /// the IPC leg; WebSocket fan-out always runs when enabled.
    #[must_use]
    pub fn new(enabled: bool, socket_path: Option<PathBuf>) -> Self {
        Self {
            enabled,
            socket_path,
            hub: WsHub::default(),
        }
    }

    /// The WebSocket hub, for the management API to register clients.
    #[must_use]
    pub fn hub(&self) -> &WsHub {
        &self.hub
    }

    /// Deliver a notification to every attached UI.
    ///
    /// No-op success when notifications are disabled. Returns an error
    /// only for the capacity bound; delivery failures are swallowed.
    pub async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let serialised = serde_json::to_string(notification)?;
        if serialised.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge(serialised.len()));
        }

        self.hub.broadcast(&serialised);

        if let Some(path) = &self.socket_path {
            if let Err(e) = ipc_send(path, serialised.as_bytes()).await {
                tracing::debug!("notify socket unavailable: {e}");
            }
        }
        Ok(())
    }
}

/// Length-prefixed write to the local IPC socket.
///
/// 4-byte little-endian length, then the UTF-8 JSON body in chunks of
/// at most 32 KiB. An optional acknowledgement JSON is read back; its
/// `error` field escalates.
#[cfg(unix)]
async fn ipc_send(path: &std::path::Path, payload: &[u8]) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    let mut stream = tokio::time::timeout(IPC_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| Error::Timeout(IPC_TIMEOUT.as_secs()))??;

    let len = u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
    let write = async {
        stream.write_all(&len.to_le_bytes()).await?;
        for chunk in payload.chunks(MAX_PAYLOAD) {
            stream.write_all(chunk).await?;
        }
        stream.flush().await?;
        std::io::Result::Ok(())
    };
    tokio::time::timeout(IPC_TIMEOUT, write)
        .await
        .map_err(|_| Error::Timeout(IPC_TIMEOUT.as_secs()))??;

    // Best-effort acknowledgement; only an explicit error escalates.
    let mut ack = vec![0u8; 1024];
    if let Ok(Ok(n)) = tokio::time::timeout(IPC_TIMEOUT, stream.read(&mut ack)).await {
        if n > 0 {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&ack[..n]) {
                if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
                    return Err(Error::Internal(format!("notify ack error: {err}")));
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn ipc_send(_path: &std::path::Path, _payload: &[u8]) -> Result<()> {
    Ok(())
}
