//! Transfer session state.
//!
//! Three stores live here:
//!
//! - [`UploadStore`] - sessions this node accepted as a receiver. One
//!   mutex guards every map so cross-map operations (token check +
//!   progress update + completion decision) are atomic.
//! - [`OutgoingStore`] - sessions this node initiated as a sender.
//! - [`ConfirmRegistry`] - single-use rendezvous channels carrying the
//!   user's accept/reject decisions into waiting handlers.
//!
//! Each active session exclusively owns a cancellation token; the store
//! signals it on removal, whether by cancel, completion, or TTL expiry.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::discovery::peers::DiscoveredPeer;
use crate::error::{Error, Result};
use crate::protocol::FileInfo;

/// Idle TTL of a receiving session.
pub const UPLOAD_SESSION_TTL: Duration = Duration::from_secs(120);

/// TTL of a v1 address→session binding.
pub const V1_BINDING_TTL: Duration = Duration::from_secs(120);

/// TTL of an initiated (outgoing) session.
pub const OUTGOING_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Progress bookkeeping for one receiving session.
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    /// Files negotiated in prepare-upload
    pub total_files: usize,
    /// Files persisted and verified
    pub success_files: usize,
    /// Files that failed verification or transfer
    pub failed_files: usize,
    /// Ids of the failed files
    pub failed_file_ids: Vec<String>,
    /// Declared names, in completion order
    pub file_names: Vec<String>,
    /// Names actually written (after collision renaming)
    pub saved_file_names: Vec<String>,
    /// Absolute save paths of successful files
    pub save_paths: Vec<String>,
}

/// Everything the upload handler needs after validation.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    /// The file's declared metadata
    pub info: FileInfo,
    /// The session's cancellation scope
    pub cancel: CancellationToken,
    /// Alias of the negotiating sender
    pub sender_alias: String,
    /// True on the session's first upload (emit `upload_start` once)
    pub first_file: bool,
    /// Files negotiated in the session
    pub total_files: usize,
}

/// Result of marking one file finished.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    /// Files still pending after this one
    pub remaining: usize,
    /// True iff this call consumed the last pending file
    pub is_last: bool,
    /// Stats snapshot taken under the same lock
    pub stats: UploadStats,
}

struct UploadEntry {
    files: HashMap<String, FileInfo>,
    tokens: HashMap<String, String>,
    pending: HashSet<String>,
    sender_alias: String,
    sender_ip: IpAddr,
    validated: bool,
    started: bool,
    cancel: CancellationToken,
    stats: UploadStats,
    expires_at: Instant,
}

/// Store of sessions this node is receiving.
#[derive(Clone)]
pub struct UploadStore {
    inner: Arc<Mutex<UploadState>>,
}

struct UploadState {
    sessions: HashMap<String, UploadEntry>,
    v1_bindings: HashMap<IpAddr, (String, Instant)>,
}

impl Default for UploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UploadState {
                sessions: HashMap::new(),
                v1_bindings: HashMap::new(),
            })),
        }
    }

    /// Register an accepted session and issue per-file tokens.
    ///
    /// The caller supplies the session id (the ask-session generated at
    /// the top of the gate sequence). Returns the fileId→token map for
    /// the wire response and the session's cancellation token.
    pub fn create_session(
        &self,
        session_id: &str,
        files: HashMap<String, FileInfo>,
        sender_alias: &str,
        sender_ip: IpAddr,
    ) -> (HashMap<String, String>, CancellationToken) {
        let tokens: HashMap<String, String> = files
            .keys()
            .map(|id| (id.clone(), Uuid::new_v4().to_string()))
            .collect();
        let cancel = CancellationToken::new();

        let entry = UploadEntry {
            pending: files.keys().cloned().collect(),
            stats: UploadStats {
                total_files: files.len(),
                ..UploadStats::default()
            },
            tokens: tokens.clone(),
            files,
            sender_alias: sender_alias.to_string(),
            sender_ip,
            validated: false,
            started: false,
            cancel: cancel.clone(),
            expires_at: Instant::now() + UPLOAD_SESSION_TTL,
        };

        let mut state = self.inner.lock().expect("session lock poisoned");
        state.sessions.insert(session_id.to_string(), entry);
        (tokens, cancel)
    }

    /// Validate an upload call and hand back what the receiver needs.
    ///
    /// Checks, in order: session exists and is not cancelled or
    /// expired, the token matches the one issued for this file, the
    /// source address matches the negotiating sender, and the file is
    /// still pending. Marks the session validated and refreshes its
    /// TTL.
    pub fn begin_upload(
        &self,
        session_id: &str,
        file_id: &str,
        token: &str,
        source_ip: IpAddr,
    ) -> Result<UploadGrant> {
        let mut state = self.inner.lock().expect("session lock poisoned");
        let entry = state
            .sessions
            .get_mut(session_id)
            .filter(|e| e.expires_at > Instant::now())
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        if entry.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if entry.tokens.get(file_id).map(String::as_str) != Some(token) {
            return Err(Error::InvalidToken(file_id.to_string()));
        }
        if entry.sender_ip != source_ip {
            return Err(Error::InvalidToken(file_id.to_string()));
        }
        let info = entry
            .files
            .get(file_id)
            .filter(|_| entry.pending.contains(file_id))
            .cloned()
            .ok_or_else(|| Error::InvalidBody(format!("file '{file_id}' not pending")))?;

        entry.validated = true;
        entry.expires_at = Instant::now() + UPLOAD_SESSION_TTL;
        let first_file = !entry.started;
        entry.started = true;
        Ok(UploadGrant {
            info,
            cancel: entry.cancel.clone(),
            sender_alias: entry.sender_alias.clone(),
            first_file,
            total_files: entry.stats.total_files,
        })
    }

    /// Record a file outcome and decide completion.
    ///
    /// `is_last` is true iff this call consumed the last pending file;
    /// the session entry is deleted at that moment and its v1 binding
    /// dropped, but the returned stats snapshot survives for the end
    /// notification.
    pub fn mark_file_done(
        &self,
        session_id: &str,
        file_id: &str,
        success: bool,
        saved: Option<(String, PathBuf)>,
    ) -> Result<CompletionReport> {
        let mut state = self.inner.lock().expect("session lock poisoned");
        let entry = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        if !entry.pending.remove(file_id) {
            return Err(Error::InvalidBody(format!("file '{file_id}' not pending")));
        }
        if let Some(info) = entry.files.get(file_id) {
            entry.stats.file_names.push(info.file_name.clone());
        }
        if success {
            entry.stats.success_files += 1;
            if let Some((name, path)) = saved {
                entry.stats.saved_file_names.push(name);
                entry.stats.save_paths.push(path.display().to_string());
            }
        } else {
            entry.stats.failed_files += 1;
            entry.stats.failed_file_ids.push(file_id.to_string());
        }
        entry.expires_at = Instant::now() + UPLOAD_SESSION_TTL;

        let remaining = entry.pending.len();
        let is_last = remaining == 0;
        let stats = entry.stats.clone();
        if is_last {
            state.sessions.remove(session_id);
            state.v1_bindings.retain(|_, (sid, _)| sid != session_id);
        }
        Ok(CompletionReport {
            remaining,
            is_last,
            stats,
        })
    }

    /// Cancel a session, signalling its token.
    ///
    /// Returns the stats at cancellation time and whether any upload
    /// had begun (deciding if an `upload_end` is owed), or `None` for
    /// an unknown session (the completion path may have already
    /// removed it).
    pub fn cancel_session(&self, session_id: &str) -> Option<(UploadStats, bool)> {
        let mut state = self.inner.lock().expect("session lock poisoned");
        let entry = state.sessions.remove(session_id)?;
        state.v1_bindings.retain(|_, (sid, _)| sid != session_id);
        entry.cancel.cancel();
        Some((entry.stats, entry.started))
    }

    /// Whether a live session exists under this id.
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        let state = self.inner.lock().expect("session lock poisoned");
        state
            .sessions
            .get(session_id)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    /// Whether a session has seen at least one authorised upload call.
    #[must_use]
    pub fn is_validated(&self, session_id: &str) -> bool {
        let state = self.inner.lock().expect("session lock poisoned");
        state.sessions.get(session_id).is_some_and(|e| e.validated)
    }

    /// Bind a legacy client address to its current session.
    pub fn bind_v1(&self, ip: IpAddr, session_id: &str) {
        let mut state = self.inner.lock().expect("session lock poisoned");
        state.v1_bindings.insert(
            ip,
            (session_id.to_string(), Instant::now() + V1_BINDING_TTL),
        );
    }

    /// Session currently bound to a legacy client address.
    #[must_use]
    pub fn v1_session(&self, ip: IpAddr) -> Option<String> {
        let mut state = self.inner.lock().expect("session lock poisoned");
        match state.v1_bindings.get(&ip) {
            Some((sid, expires)) if *expires > Instant::now() => Some(sid.clone()),
            Some(_) => {
                state.v1_bindings.remove(&ip);
                None
            }
            None => None,
        }
    }

    /// Token issued for a file in a live session (v1 `send` lookup).
    #[must_use]
    pub fn token_for(&self, session_id: &str, file_id: &str) -> Option<String> {
        let state = self.inner.lock().expect("session lock poisoned");
        state
            .sessions
            .get(session_id)
            .and_then(|e| e.tokens.get(file_id).cloned())
    }

    /// Signal and drop every live session (process shutdown).
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock().expect("session lock poisoned");
        for (id, entry) in state.sessions.drain() {
            entry.cancel.cancel();
            tracing::debug!("upload session {id} cancelled on shutdown");
        }
        state.v1_bindings.clear();
    }

    /// Drop expired sessions, signalling their cancellation tokens.
    pub fn sweep(&self) -> usize {
        let mut state = self.inner.lock().expect("session lock poisoned");
        let now = Instant::now();
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = state.sessions.remove(id) {
                entry.cancel.cancel();
                tracing::debug!("upload session {id} expired");
            }
        }
        state.v1_bindings.retain(|_, (_, expires)| *expires > now);
        expired.len()
    }

    /// Spawn the low-frequency expiry sweeper.
    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}

/// A session this node initiated towards a peer.
#[derive(Debug, Clone)]
pub struct OutgoingSession {
    /// The receiving peer
    pub peer: DiscoveredPeer,
    /// Session id issued by the peer
    pub session_id: String,
    /// fileId → upload token issued by the peer
    pub tokens: HashMap<String, String>,
    /// Files as negotiated
    pub files: HashMap<String, FileInfo>,
    /// Local source paths for entries this node resolved itself
    pub paths: HashMap<String, PathBuf>,
    /// Cancellation scope of the whole session
    pub cancel: CancellationToken,
}

/// Store of sessions this node is sending.
#[derive(Clone)]
pub struct OutgoingStore {
    sessions: crate::cache::TtlCache<String, OutgoingSession>,
}

impl Default for OutgoingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: crate::cache::TtlCache::new(OUTGOING_SESSION_TTL),
        }
    }

    /// Record a freshly negotiated outgoing session.
    pub fn insert(&self, session: OutgoingSession) {
        self.sessions.set(session.session_id.clone(), session);
    }

    /// Look up by remote session id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<OutgoingSession> {
        self.sessions.get(&session_id.to_string())
    }

    /// Cancel and remove; returns the session for the best-effort
    /// remote cancel call.
    pub fn cancel(&self, session_id: &str) -> Option<OutgoingSession> {
        let session = self.sessions.delete(&session_id.to_string())?;
        session.cancel.cancel();
        Some(session)
    }

    /// Remove a completed session without signalling it.
    pub fn remove(&self, session_id: &str) {
        self.sessions.delete(&session_id.to_string());
    }

    /// Signal every live outgoing session (process shutdown).
    pub fn cancel_all(&self) {
        let mut ids = Vec::new();
        self.sessions.range(|id, session| {
            session.cancel.cancel();
            ids.push(id.clone());
        });
        for id in ids {
            self.sessions.delete(&id);
        }
    }
}

/// Registry of single-use accept/reject rendezvous channels.
///
/// Publishers never block: the channel buffers exactly one decision
/// and a second publish is dropped, so a stale confirm endpoint call
/// can never deadlock anything.
#[derive(Clone, Default)]
pub struct ConfirmRegistry {
    channels: Arc<Mutex<HashMap<String, mpsc::Sender<bool>>>>,
}

impl ConfirmRegistry {
    /// Open a rendezvous for `key`, replacing any stale one.
    ///
    /// The handler awaits the returned receiver; the registry entry is
    /// removed when a decision is published or the waiter gives up and
    /// calls [`Self::close`].
    #[must_use]
    pub fn open(&self, key: &str) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(1);
        self.channels
            .lock()
            .expect("confirm lock poisoned")
            .insert(key.to_string(), tx);
        rx
    }

    /// Publish a decision; non-blocking.
    ///
    /// Returns `false` when no waiter is registered under `key` or the
    /// buffered slot is already taken.
    pub fn publish(&self, key: &str, decision: bool) -> bool {
        let tx = {
            let channels = self.channels.lock().expect("confirm lock poisoned");
            channels.get(key).cloned()
        };
        tx.is_some_and(|tx| tx.try_send(decision).is_ok())
    }

    /// Whether a waiter is currently registered under `key`.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.channels
            .lock()
            .expect("confirm lock poisoned")
            .contains_key(key)
    }

    /// Whether any waiter at all is registered (contention check).
    #[must_use]
    pub fn is_pending_any(&self) -> bool {
        !self
            .channels
            .lock()
            .expect("confirm lock poisoned")
            .is_empty()
    }

    /// Keys with registered waiters.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.channels
            .lock()
            .expect("confirm lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Remove the rendezvous for `key`.
    pub fn close(&self, key: &str) {
        self.channels
            .lock()
            .expect("confirm lock poisoned")
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn files(n: usize) -> HashMap<String, FileInfo> {
        (0..n)
            .map(|i| {
                let id = format!("f{i}");
                (
                    id.clone(),
                    FileInfo {
                        id,
                        file_name: format!("file-{i}.bin"),
                        size: 10,
                        ..FileInfo::default()
                    },
                )
            })
            .collect()
    }

    fn sender_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_create_issues_one_token_per_file() {
        let store = UploadStore::new();
        let (tokens, _cancel) = store.create_session("s1", files(3), "A", sender_ip());
        assert_eq!(tokens.len(), 3);
        assert!(store.has_session("s1"));
        // Tokens are distinct.
        let set: HashSet<_> = tokens.values().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_two_sessions_are_independent() {
        let store = UploadStore::new();
        store.create_session("s1", files(1), "A", sender_ip());
        store.create_session("s2", files(1), "A", sender_ip());
        assert!(store.cancel_session("s1").is_some());
        assert!(store.has_session("s2"));
    }

    #[test]
    fn test_begin_upload_validates_token_and_source() {
        let store = UploadStore::new();
        let (tokens, _) = store.create_session("s1", files(1), "A", sender_ip());
        let token = tokens["f0"].clone();

        let err = store
            .begin_upload("s1", "f0", "wrong", sender_ip())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));

        let other_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99));
        let err = store
            .begin_upload("s1", "f0", &token, other_ip)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));

        let grant = store
            .begin_upload("s1", "f0", &token, sender_ip())
            .expect("valid upload");
        assert_eq!(grant.info.file_name, "file-0.bin");
        assert_eq!(grant.sender_alias, "A");
        assert!(grant.first_file);
        assert_eq!(grant.total_files, 1);
    }

    #[test]
    fn test_upload_start_flag_fires_once() {
        let store = UploadStore::new();
        let (tokens, _) = store.create_session("s1", files(2), "A", sender_ip());
        let first = store
            .begin_upload("s1", "f0", &tokens["f0"], sender_ip())
            .unwrap();
        assert!(first.first_file);
        let second = store
            .begin_upload("s1", "f1", &tokens["f1"], sender_ip())
            .unwrap();
        assert!(!second.first_file);
    }

    #[test]
    fn test_cancelled_session_rejects_uploads() {
        let store = UploadStore::new();
        let (tokens, cancel) = store.create_session("s1", files(1), "A", sender_ip());
        cancel.cancel();
        let err = store
            .begin_upload("s1", "f0", &tokens["f0"], sender_ip())
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_mark_file_done_counts_to_completion() {
        let store = UploadStore::new();
        store.create_session("s1", files(3), "A", sender_ip());
        let session_id = "s1".to_string();

        let report = store
            .mark_file_done(
                &session_id,
                "f0",
                true,
                Some(("file-0.bin".into(), PathBuf::from("/tmp/file-0.bin"))),
            )
            .unwrap();
        assert_eq!(report.remaining, 2);
        assert!(!report.is_last);

        let report = store.mark_file_done(&session_id, "f1", false, None).unwrap();
        assert_eq!(report.remaining, 1);

        let report = store
            .mark_file_done(
                &session_id,
                "f2",
                true,
                Some(("file-2.bin".into(), PathBuf::from("/tmp/file-2.bin"))),
            )
            .unwrap();
        assert!(report.is_last);
        assert_eq!(report.stats.success_files, 2);
        assert_eq!(report.stats.failed_files, 1);
        assert_eq!(report.stats.failed_file_ids, vec!["f1".to_string()]);
        assert_eq!(
            report.stats.success_files + report.stats.failed_files,
            report.stats.total_files
        );
        // Entry is gone once the last file is consumed.
        assert!(!store.has_session(&session_id));
    }

    #[test]
    fn test_double_completion_is_rejected() {
        let store = UploadStore::new();
        store.create_session("s1", files(2), "A", sender_ip());
        store.mark_file_done("s1", "f0", true, None).unwrap();
        let err = store.mark_file_done("s1", "f0", true, None).unwrap_err();
        assert!(matches!(err, Error::InvalidBody(_)));
    }

    #[test]
    fn test_cancel_signals_token() {
        let store = UploadStore::new();
        let (_, cancel) = store.create_session("s1", files(1), "A", sender_ip());
        assert!(!cancel.is_cancelled());
        store.cancel_session("s1");
        assert!(cancel.is_cancelled());
        assert!(!store.has_session("s1"));
    }

    #[test]
    fn test_v1_binding_roundtrip() {
        let store = UploadStore::new();
        store.create_session("s1", files(1), "A", sender_ip());
        store.bind_v1(sender_ip(), "s1");
        assert_eq!(store.v1_session(sender_ip()), Some("s1".to_string()));
        // Completing the last file drops the binding too.
        store.mark_file_done("s1", "f0", true, None).unwrap();
        assert_eq!(store.v1_session(sender_ip()), None);
    }

    #[test]
    fn test_outgoing_store_cancel() {
        let store = OutgoingStore::new();
        let cancel = CancellationToken::new();
        store.insert(OutgoingSession {
            peer: DiscoveredPeer {
                descriptor: crate::protocol::DeviceDescriptor::default(),
                ip: Ipv4Addr::new(10, 0, 0, 2),
            },
            session_id: "remote-1".to_string(),
            tokens: HashMap::new(),
            files: HashMap::new(),
            paths: HashMap::new(),
            cancel: cancel.clone(),
        });
        assert!(store.get("remote-1").is_some());
        store.cancel("remote-1");
        assert!(cancel.is_cancelled());
        assert!(store.get("remote-1").is_none());
    }

    #[tokio::test]
    async fn test_confirm_rendezvous() {
        let registry = ConfirmRegistry::default();
        let mut rx = registry.open("s1");
        assert!(registry.is_pending("s1"));
        assert!(registry.publish("s1", true));
        assert_eq!(rx.recv().await, Some(true));
        registry.close("s1");
        assert!(!registry.is_pending("s1"));
    }

    #[test]
    fn test_confirm_publish_without_waiter_is_noop() {
        let registry = ConfirmRegistry::default();
        assert!(!registry.publish("nobody", true));
    }

    #[test]
    fn test_confirm_second_publish_dropped() {
        let registry = ConfirmRegistry::default();
        let _rx = registry.open("s1");
        assert!(registry.publish("s1", true));
        // Buffer of one: the second publish must not block, just fail.
        assert!(!registry.publish("s1", false));
    }

    #[test]
    fn test_sweep_leaves_live_sessions() {
        let store = UploadStore::new();
        let (_, cancel) = store.create_session("s1", files(1), "A", sender_ip());
        // Nothing expired yet.
        assert_eq!(store.sweep(), 0);
        assert!(store.has_session("s1"));
        assert!(!cancel.is_cancelled());
    }
}
