//! Share sessions: the reverse-download path.
//!
//! The user publishes files under a short session id; peers fetch the
//! listing with `prepare-download` and pull bytes with `download`.
//! Confirmation is per client (keyed by the peer's source address), so
//! two devices pulling the same share are approved independently.
//!
//! Directories are enumerated recursively, keeping
//! `folderName/relative/path` naming. File ids are the first 16 hex
//! characters of SHA-256 over the absolute path, so re-publishing the
//! same tree yields the same ids.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{Notification, Notifier};
use crate::protocol::{FileInfo, PrepareDownloadResponse};
use crate::session::ConfirmRegistry;

/// TTL of a share session.
pub const SHARE_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// How long the publisher has to confirm a client.
pub const DOWNLOAD_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hashing is skipped above this many files to keep publish fast.
const HASH_FILE_LIMIT: usize = 50;

/// One published file.
#[derive(Debug, Clone)]
pub struct ShareEntry {
    /// Wire-visible metadata
    pub info: FileInfo,
    /// Where the bytes live locally
    pub path: PathBuf,
}

/// A published share.
#[derive(Debug, Default)]
pub struct ShareSession {
    /// Short 8-hex id
    pub id: String,
    /// fileId → entry
    pub files: HashMap<String, ShareEntry>,
    /// Optional PIN gating the listing
    pub pin: Option<String>,
    /// Skip per-client confirmation entirely
    pub auto_accept: bool,
    /// Client keys the publisher has approved
    pub confirmed: HashSet<String>,
    /// Directory to delete with the session (multipart uploads)
    pub owned_dir: Option<PathBuf>,
}

/// Outcome of a `prepare-download` call.
#[derive(Debug)]
pub enum DownloadGate {
    /// Confirmed: here is the listing
    Listing(Box<PrepareDownloadResponse>),
    /// Not yet confirmed: answer 202 and keep polling
    Waiting,
}

/// The share/download engine.
#[derive(Clone)]
pub struct ShareEngine {
    config: Arc<RwLock<Config>>,
    sessions: crate::cache::TtlCache<String, Arc<RwLock<ShareSession>>>,
    confirms: ConfirmRegistry,
    notifier: Notifier,
}

impl ShareEngine {
    /// Build the engine over the shared config and notifier.
    #[must_use]
    pub fn new(config: Arc<RwLock<Config>>, confirms: ConfirmRegistry, notifier: Notifier) -> Self {
        Self {
            config,
            sessions: crate::cache::TtlCache::new(SHARE_SESSION_TTL),
            confirms,
            notifier,
        }
    }

    /// Publish files (or directory trees) for peers to pull.
    ///
    /// Inputs may be `file://` URLs or plain paths. Returns the session
    /// id and the download URL to hand to the user.
    pub async fn create_session(
        &self,
        inputs: Vec<String>,
        pin: Option<String>,
        auto_accept: bool,
    ) -> Result<(String, String)> {
        let entries = tokio::task::spawn_blocking(move || collect_entries(&inputs))
            .await
            .map_err(|e| Error::Internal(format!("enumerate share: {e}")))??;

        if entries.is_empty() {
            return Err(Error::InvalidBody("share has no files".to_string()));
        }

        let id = short_session_id();
        let files: HashMap<String, ShareEntry> = entries
            .into_iter()
            .map(|entry| (entry.info.id.clone(), entry))
            .collect();

        let session = ShareSession {
            id: id.clone(),
            files,
            pin,
            auto_accept,
            confirmed: HashSet::new(),
            owned_dir: None,
        };
        self.sessions.set(id.clone(), Arc::new(RwLock::new(session)));

        Ok((id.clone(), self.download_url(&id)))
    }

    /// Publish files that were uploaded through the management API.
    ///
    /// The caller supplies the id (its upload directory is named after
    /// it); the whole `owned_dir` is deleted when the session closes.
    pub fn create_session_owned(
        &self,
        id: String,
        entries: Vec<ShareEntry>,
        owned_dir: PathBuf,
        pin: Option<String>,
        auto_accept: bool,
    ) -> Result<(String, String)> {
        if entries.is_empty() {
            return Err(Error::InvalidBody("share has no files".to_string()));
        }
        let session = ShareSession {
            id: id.clone(),
            files: entries
                .into_iter()
                .map(|entry| (entry.info.id.clone(), entry))
                .collect(),
            pin,
            auto_accept,
            confirmed: HashSet::new(),
            owned_dir: Some(owned_dir),
        };
        self.sessions.set(id.clone(), Arc::new(RwLock::new(session)));
        Ok((id.clone(), self.download_url(&id)))
    }

    fn download_url(&self, id: &str) -> String {
        let config = self.config.read().expect("config lock poisoned");
        let host = crate::netutil::primary_ipv4()
            .map_or_else(|| "127.0.0.1".to_string(), |ip| ip.to_string());
        format!("{}://{host}:{}/?session={id}", config.protocol, config.port)
    }

    /// Gate a `prepare-download` call for one client.
    pub async fn prepare_download(
        &self,
        session_id: &str,
        pin: Option<&str>,
        client_key: &str,
    ) -> Result<DownloadGate> {
        let session = self
            .sessions
            .get(&session_id.to_string())
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        {
            let session = session.read().expect("share lock poisoned");
            if let Some(required) = &session.pin {
                match pin {
                    None => return Err(Error::PinRequired),
                    Some(provided) if provided != required => return Err(Error::InvalidPin),
                    Some(_) => {}
                }
            }
            if session.auto_accept || session.confirmed.contains(client_key) {
                return Ok(DownloadGate::Listing(Box::new(
                    self.listing(&session, session_id),
                )));
            }
        }

        let confirm_key = format!("download:{session_id}:{client_key}");
        if self.confirms.is_pending(&confirm_key) {
            // Client is polling while the prompt is still open.
            return Ok(DownloadGate::Waiting);
        }

        let files: Vec<FileInfo> = {
            let session = session.read().expect("share lock poisoned");
            session.files.values().map(|e| e.info.clone()).collect()
        };
        let refs: Vec<&FileInfo> = files.iter().collect();
        let note = Notification::confirm_download(session_id, client_key, &refs);
        let _ = self.notifier.send(&note).await;

        let mut decision_rx = self.confirms.open(&confirm_key);
        let confirms = self.confirms.clone();
        let session_arc = Arc::clone(&session);
        let client = client_key.to_string();
        tokio::spawn(async move {
            let decision = tokio::time::timeout(DOWNLOAD_CONFIRM_TIMEOUT, decision_rx.recv()).await;
            confirms.close(&confirm_key);
            if matches!(decision, Ok(Some(true))) {
                session_arc
                    .write()
                    .expect("share lock poisoned")
                    .confirmed
                    .insert(client);
            }
        });

        Ok(DownloadGate::Waiting)
    }

    fn listing(&self, session: &ShareSession, session_id: &str) -> PrepareDownloadResponse {
        let config = self.config.read().expect("config lock poisoned");
        PrepareDownloadResponse {
            info: config.descriptor(),
            session_id: session_id.to_string(),
            files: session
                .files
                .iter()
                .map(|(id, entry)| (id.clone(), entry.info.clone()))
                .collect(),
        }
    }

    /// Resolve a published file for serving.
    ///
    /// Unconfirmed clients are refused unless the share auto-accepts.
    pub fn file_for_download(
        &self,
        session_id: &str,
        file_id: &str,
        client_key: &str,
    ) -> Result<ShareEntry> {
        let session = self
            .sessions
            .get(&session_id.to_string())
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;
        let session = session.read().expect("share lock poisoned");
        if !session.auto_accept && !session.confirmed.contains(client_key) {
            return Err(Error::Rejected);
        }
        session
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    /// Close a session, deleting any directory it owns.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .delete(&session_id.to_string())
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;
        let owned = session.read().expect("share lock poisoned").owned_dir.clone();
        if let Some(dir) = owned {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!("cleanup {}: {e}", dir.display());
            }
        }
        Ok(())
    }

    /// Live session ids (management listing).
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.sessions.range(|id, _| ids.push(id.clone()));
        ids
    }
}

/// Enumerate a folder the way a directory share does: recursive,
/// `folderName/relative/path` naming, deterministic file ids.
pub fn enumerate_folder(dir: &Path) -> Result<Vec<ShareEntry>> {
    if !dir.is_dir() {
        return Err(Error::InvalidPath(dir.display().to_string()));
    }
    collect_dir(dir)
}

/// Build a share entry for one file under its wire name.
pub fn entry_for_upload(path: &Path, wire_name: String) -> Result<ShareEntry> {
    entry_for_named(path, wire_name, false)
}

/// Deterministic 16-hex file id from an absolute path.
#[must_use]
pub fn file_id_for(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Random 8-hex share session id.
#[must_use]
pub fn short_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn strip_file_url(input: &str) -> &str {
    input.strip_prefix("file://").unwrap_or(input)
}

fn collect_entries(inputs: &[String]) -> Result<Vec<ShareEntry>> {
    let mut singles: Vec<PathBuf> = Vec::new();
    let mut entries = Vec::new();

    for input in inputs {
        let path = PathBuf::from(strip_file_url(input));
        if !path.exists() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        if path.is_dir() {
            entries.extend(collect_dir(&path)?);
        } else {
            singles.push(path);
        }
    }

    // Skip content hashing on large batches for publish throughput.
    let hash_singles = singles.len() + entries.len() <= HASH_FILE_LIMIT;
    for path in singles {
        let wire_name = file_name_of(&path);
        entries.push(entry_for_named(&path, wire_name, hash_singles)?);
    }
    Ok(entries)
}

fn collect_dir(dir: &Path) -> Result<Vec<ShareEntry>> {
    let folder_name = file_name_of(dir);
    let mut entries = Vec::new();
    for item in walkdir::WalkDir::new(dir).follow_links(false) {
        let item = item.map_err(|e| Error::InvalidPath(format!("{}: {e}", dir.display())))?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::Internal(format!("walk prefix: {e}")))?;
        let wire_name = format!("{folder_name}/{}", relative.to_string_lossy());
        entries.push(entry_for_named(item.path(), wire_name, false)?);
    }
    Ok(entries)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().to_string())
}

fn entry_for_named(path: &Path, wire_name: String, hash: bool) -> Result<ShareEntry> {
    let metadata = std::fs::metadata(path)?;
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let sha256 = if hash {
        Some(hash_file(path)?)
    } else {
        None
    };
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(ShareEntry {
        info: FileInfo {
            id: file_id_for(&absolute),
            file_name: wire_name,
            size: metadata.len(),
            file_type: mime,
            sha256,
            preview: None,
            metadata: None,
        },
        path: path.to_path_buf(),
    })
}

fn hash_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> ShareEngine {
        ShareEngine::new(
            Arc::new(RwLock::new(Config::default())),
            ConfirmRegistry::default(),
            Notifier::new(false, None),
        )
    }

    #[tokio::test]
    async fn test_create_session_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let engine = engine();
        let (id, url) = engine
            .create_session(vec![format!("file://{}", file.display())], None, true)
            .await
            .expect("create");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(url.contains(&format!("session={id}")));
    }

    #[tokio::test]
    async fn test_directory_share_preserves_structure() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("album");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("one.txt"), b"1").unwrap();
        std::fs::write(tree.join("nested").join("two.txt"), b"2").unwrap();

        let engine = engine();
        let (id, _) = engine
            .create_session(vec![tree.display().to_string()], None, true)
            .await
            .expect("create");

        let gate = engine
            .prepare_download(&id, None, "192.168.1.50")
            .await
            .expect("listing");
        let DownloadGate::Listing(listing) = gate else {
            panic!("auto-accept share should list immediately");
        };
        let mut names: Vec<String> = listing
            .files
            .values()
            .map(|f| f.file_name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["album/nested/two.txt", "album/one.txt"]);
    }

    #[tokio::test]
    async fn test_file_ids_are_deterministic() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let engine = engine();
        let (first, _) = engine
            .create_session(vec![file.display().to_string()], None, true)
            .await
            .unwrap();
        let (second, _) = engine
            .create_session(vec![file.display().to_string()], None, true)
            .await
            .unwrap();

        let id_of = |session: &str, engine: &ShareEngine| -> String {
            let entry = engine
                .sessions
                .get(&session.to_string())
                .expect("session exists");
            let entry = entry.read().unwrap();
            entry.files.keys().next().unwrap().clone()
        };
        assert_eq!(id_of(&first, &engine), id_of(&second, &engine));
        assert_eq!(id_of(&first, &engine).len(), 16);
    }

    #[tokio::test]
    async fn test_pin_gate_on_prepare_download() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let engine = engine();
        let (id, _) = engine
            .create_session(
                vec![file.display().to_string()],
                Some("4321".to_string()),
                true,
            )
            .await
            .unwrap();

        assert!(matches!(
            engine.prepare_download(&id, None, "c1").await,
            Err(Error::PinRequired)
        ));
        assert!(matches!(
            engine.prepare_download(&id, Some("0000"), "c1").await,
            Err(Error::InvalidPin)
        ));
        assert!(matches!(
            engine.prepare_download(&id, Some("4321"), "c1").await,
            Ok(DownloadGate::Listing(_))
        ));
    }

    #[tokio::test]
    async fn test_per_client_confirmation_flow() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let engine = engine();
        let (id, _) = engine
            .create_session(vec![file.display().to_string()], None, false)
            .await
            .unwrap();

        // First poll: waiting, prompt registered.
        assert!(matches!(
            engine.prepare_download(&id, None, "192.168.1.50").await,
            Ok(DownloadGate::Waiting)
        ));
        // Second poll while pending: still waiting, no duplicate prompt.
        assert!(matches!(
            engine.prepare_download(&id, None, "192.168.1.50").await,
            Ok(DownloadGate::Waiting)
        ));
        // Unconfirmed downloads are refused.
        let file_id = {
            let session = engine.sessions.get(&id).unwrap();
            let session = session.read().unwrap();
            session.files.keys().next().unwrap().clone()
        };
        assert!(matches!(
            engine.file_for_download(&id, &file_id, "192.168.1.50"),
            Err(Error::Rejected)
        ));

        // Publisher confirms.
        let key = format!("download:{id}:192.168.1.50");
        assert!(engine.confirms.publish(&key, true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            engine.prepare_download(&id, None, "192.168.1.50").await,
            Ok(DownloadGate::Listing(_))
        ));
        assert!(engine
            .file_for_download(&id, &file_id, "192.168.1.50")
            .is_ok());
        // A different client is still unconfirmed.
        assert!(matches!(
            engine.file_for_download(&id, &file_id, "192.168.1.60"),
            Err(Error::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_close_session_removes_owned_dir() {
        let dir = TempDir::new().unwrap();
        let owned = dir.path().join("share-uploads").join("ab12cd34");
        std::fs::create_dir_all(&owned).unwrap();
        let file = owned.join("up.bin");
        std::fs::write(&file, b"data").unwrap();

        let engine = engine();
        let entry = entry_for_named(&file, "up.bin".to_string(), false).unwrap();
        let (id, _) = engine
            .create_session_owned(
                "ab12cd34".to_string(),
                vec![entry],
                owned.clone(),
                None,
                true,
            )
            .unwrap();

        engine.close_session(&id).expect("close");
        assert!(!owned.exists());
        assert!(matches!(
            engine.file_for_download(&id, "x", "c"),
            Err(Error::UnknownSession(_))
        ));
    }
}
