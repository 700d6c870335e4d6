//! Receiving side: the prepare-upload decision sequence and the
//! verified streaming write.
//!
//! An incoming prepare-upload runs through four gates in order: PIN,
//! text-message shortcut, user confirmation (with favourites
//! auto-accept), and finally session creation. The upload handler then
//! streams each file through [`persist_stream`], which owns the
//! path-traversal guard, collision renaming, hash/size verification,
//! and cancellation-aware copying.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{Notification, Notifier};
use crate::protocol::{PrepareUploadRequest, PrepareUploadResponse};
use crate::session::{ConfirmRegistry, UploadStore};

/// How long the user has to accept or reject a transfer.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a text message stays on screen awaiting dismissal.
pub const TEXT_DISMISS_TIMEOUT: Duration = Duration::from_secs(120);

/// Copy buffer for the streaming write.
const COPY_BUFFER: usize = 2 * 1024 * 1024;

/// The receiving-side gate keeper.
#[derive(Clone)]
pub struct Receiver {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    store: UploadStore,
    confirms: ConfirmRegistry,
    notifier: Notifier,
}

impl Receiver {
    /// Build a receiver over the shared stores.
    #[must_use]
    pub fn new(
        config: Arc<RwLock<Config>>,
        config_path: PathBuf,
        store: UploadStore,
        confirms: ConfirmRegistry,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            confirms,
            notifier,
        }
    }

    /// The confirm registry the management API publishes decisions to.
    #[must_use]
    pub fn confirms(&self) -> &ConfirmRegistry {
        &self.confirms
    }

    fn config_snapshot(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Run the full prepare-upload gate sequence.
    ///
    /// `Ok(None)` is the text-received shortcut: the caller answers 204
    /// and nothing touches the disk. `Ok(Some(..))` carries the session
    /// and token map for the 200 response.
    pub async fn handle_prepare_upload(
        &self,
        request: &PrepareUploadRequest,
        pin: Option<&str>,
        source_ip: std::net::IpAddr,
    ) -> Result<Option<PrepareUploadResponse>> {
        let config = self.config_snapshot();
        let ask_session = Uuid::new_v4().to_string();
        let sender = if request.info.alias.is_empty() {
            source_ip.to_string()
        } else {
            request.info.alias.clone()
        };

        if request.files.is_empty() {
            return Err(Error::InvalidBody("no files offered".to_string()));
        }

        // PIN gate.
        if !config.pin.is_empty() {
            match pin {
                None => {
                    let note = Notification::pin_required(&ask_session, &sender);
                    let _ = self.notifier.send(&note).await;
                    return Err(Error::PinRequired);
                }
                Some(provided) if provided != config.pin => {
                    return Err(Error::InvalidPin);
                }
                Some(_) => {}
            }
        }

        // Text-only shortcut: one text/plain entry with inline preview.
        if request.files.len() == 1 {
            let only = request.files.values().next().expect("len checked");
            if only.is_text_message() {
                let text = only.preview.as_deref().unwrap_or_default();
                let note = Notification::text_received(&ask_session, &sender, text);
                let _ = self.notifier.send(&note).await;

                let mut dismiss = self.confirms.open(&ask_session);
                let _ = tokio::time::timeout(TEXT_DISMISS_TIMEOUT, dismiss.recv()).await;
                self.confirms.close(&ask_session);
                return Ok(None);
            }
        }

        // Confirmation gate.
        if !config.auto_save && !self.is_favorite(&config, &request.info.fingerprint) {
            // One receive prompt at a time; download prompts are scoped
            // separately and do not contend.
            let recv_prompt_open = self
                .confirms
                .pending_keys()
                .iter()
                .any(|key| !key.starts_with("download:"));
            if recv_prompt_open {
                return Err(Error::BlockedByOther);
            }
            let files: Vec<&crate::protocol::FileInfo> = request.files.values().collect();
            let note = Notification::confirm_recv(&ask_session, &sender, &files);
            let _ = self.notifier.send(&note).await;

            let mut decision_rx = self.confirms.open(&ask_session);
            let decision = tokio::time::timeout(CONFIRM_TIMEOUT, decision_rx.recv()).await;
            self.confirms.close(&ask_session);
            match decision {
                Ok(Some(true)) => {}
                _ => return Err(Error::Rejected),
            }
        }

        // Join: allocate the cancellation scope and cache the file map.
        let (tokens, _cancel) =
            self.store
                .create_session(&ask_session, request.files.clone(), &sender, source_ip);
        Ok(Some(PrepareUploadResponse {
            session_id: ask_session,
            files: tokens,
        }))
    }

    /// Favourites are re-read from disk so external edits apply
    /// immediately.
    fn is_favorite(&self, config: &Config, fingerprint: &str) -> bool {
        if !config.auto_save_from_favorites || fingerprint.is_empty() {
            return false;
        }
        Config::favorites_on_disk(&self.config_path).contains(fingerprint)
    }
}

/// Decide where an incoming file lands.
///
/// The declared name may be slash-delimited to convey folder
/// structure; it is rebuilt component by component, rejecting anything
/// that would step outside the root. In per-session mode files go
/// under `root/<session_id>/`; in flat mode an existing target is
/// renamed `stem-2.ext`, `stem-3.ext`, … instead of overwritten.
pub fn resolve_target(
    upload_root: &Path,
    session_id: &str,
    file_name: &str,
    flat: bool,
) -> Result<PathBuf> {
    let base = if flat {
        upload_root.to_path_buf()
    } else {
        upload_root.join(session_id)
    };

    let relative = sanitize_relative(file_name)?;
    let mut target = base.join(&relative);

    // Second line of defence: the joined path must stay inside the base.
    if !target.starts_with(&base) {
        return Err(Error::PathTraversal(file_name.to_string()));
    }

    if flat && target.exists() {
        target = renamed_for_collision(&target)?;
    }
    Ok(target)
}

fn sanitize_relative(file_name: &str) -> Result<PathBuf> {
    if file_name.is_empty() {
        return Err(Error::InvalidPath("empty file name".to_string()));
    }
    let candidate = Path::new(file_name);
    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(file_name.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(Error::InvalidPath(file_name.to_string()));
    }
    Ok(relative)
}

fn renamed_for_collision(target: &Path) -> Result<PathBuf> {
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::InvalidPath(target.display().to_string()))?;
    let extension = target.extension().and_then(|e| e.to_str());
    let parent = target.parent().unwrap_or_else(|| Path::new(""));

    for suffix in 2u32.. {
        let name = extension.map_or_else(
            || format!("{stem}-{suffix}"),
            |ext| format!("{stem}-{suffix}.{ext}"),
        );
        let candidate = parent.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    unreachable!("collision counter exhausted")
}

/// Stream a request body into `target`, verifying as it goes.
///
/// The copy runs in 2 MiB buffered chunks with a streaming SHA-256.
/// Cancellation deletes the partial file; so does any verification
/// failure (declared size or declared digest mismatch). On success the
/// file is flushed and left in place.
pub async fn persist_stream<S, E>(
    target: &Path,
    mut body: S,
    declared_size: u64,
    declared_sha256: Option<&str>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::File::create(target).await?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => break Err(Error::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                hasher.update(&bytes);
                written += bytes.len() as u64;
                if let Err(e) = writer.write_all(&bytes).await {
                    break Err(Error::Io(e));
                }
            }
            Some(Err(e)) => break Err(Error::Transport(e.to_string())),
            None => break Ok(()),
        }
    };

    if let Err(e) = outcome {
        drop(writer);
        let _ = tokio::fs::remove_file(target).await;
        return Err(e);
    }
    writer.flush().await?;
    drop(writer);

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if declared_size > 0 && written != declared_size {
        let _ = tokio::fs::remove_file(target).await;
        return Err(Error::SizeMismatch {
            file: file_name,
            declared: declared_size,
            written,
        });
    }
    if let Some(declared) = declared_sha256 {
        if !declared.is_empty() {
            let digest = hasher.finalize();
            let actual: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            if !actual.eq_ignore_ascii_case(declared) {
                let _ = tokio::fs::remove_file(target).await;
                return Err(Error::ChecksumMismatch(file_name));
            }
        }
    }
    Ok(written)
}
