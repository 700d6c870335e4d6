//! Local management API.
//!
//! Everything under `/api/self/v1` drives this node from a UI on the
//! same machine: enumerate and scan for peers, initiate sends, publish
//! shares, answer confirmation prompts, and read or patch the runtime
//! configuration. The loopback middleware in [`super`] keeps these
//! routes off the network.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequest, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::Multipart;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::ApiFailure;
use crate::config::{ConfigPatch, FavoriteDevice, ScanMode};
use crate::context::ServiceContext;
use crate::discovery::peers::DiscoveredPeer;
use crate::discovery::ScanPause;
use crate::error::Error;
use crate::protocol::{FileInfo, Scheme, SessionQuery, UploadQuery};
use crate::session::OutgoingSession;
use crate::share;

// ============================================================================
// Views
// ============================================================================

/// A discovered peer as shown to the UI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PeerView {
    alias: String,
    ip: String,
    port: u16,
    fingerprint: String,
    protocol: Scheme,
    device_type: crate::protocol::DeviceKind,
    download: bool,
}

impl From<&DiscoveredPeer> for PeerView {
    fn from(peer: &DiscoveredPeer) -> Self {
        Self {
            alias: peer.descriptor.alias.clone(),
            ip: peer.ip.to_string(),
            port: peer.descriptor.port,
            fingerprint: peer.descriptor.fingerprint.clone(),
            protocol: peer.descriptor.protocol,
            device_type: peer.descriptor.device_type,
            download: peer.descriptor.download,
        }
    }
}

/// One local address in `get-network-info`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkInfoEntry {
    interface: String,
    ip: String,
    last_octet: u8,
}

/// Allow-listed configuration view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigView {
    alias: String,
    port: u16,
    protocol: Scheme,
    fingerprint: String,
    download: bool,
    auto_save: bool,
    auto_save_from_favorites: bool,
    upload_dir: PathBuf,
    do_not_make_session_folder: bool,
    scan_mode: ScanMode,
    pin_set: bool,
}

fn config_view(context: &ServiceContext) -> ConfigView {
    let config = context.config.read().expect("config lock poisoned");
    ConfigView {
        alias: config.alias.clone(),
        port: config.port,
        protocol: config.protocol,
        fingerprint: config.fingerprint.clone(),
        download: config.download,
        auto_save: config.auto_save,
        auto_save_from_favorites: config.auto_save_from_favorites,
        upload_dir: config.upload_dir.clone(),
        do_not_make_session_folder: config.do_not_make_session_folder,
        scan_mode: config.scan_mode,
        pin_set: !config.pin.is_empty(),
    }
}

// ============================================================================
// Discovery endpoints
// ============================================================================

/// `GET /scan-current`
pub(crate) async fn scan_current(
    State(context): State<Arc<ServiceContext>>,
) -> Json<Vec<PeerView>> {
    Json(context.peers.list().iter().map(PeerView::from).collect())
}

/// `GET /scan-now` - one synchronous sweep, peers once complete.
pub(crate) async fn scan_now(State(context): State<Arc<ServiceContext>>) -> Json<Vec<PeerView>> {
    let peers = context.discovery.scan_now().await;
    Json(peers.iter().map(PeerView::from).collect())
}

/// `GET /get-network-info`
pub(crate) async fn network_info(
    State(_context): State<Arc<ServiceContext>>,
) -> std::result::Result<Json<Vec<NetworkInfoEntry>>, ApiFailure> {
    let ifaces = crate::netutil::eligible_interfaces(None)?;
    Ok(Json(
        ifaces
            .into_iter()
            .map(|iface| NetworkInfoEntry {
                interface: iface.name,
                ip: iface.ip.to_string(),
                last_octet: iface.ip.octets()[3],
            })
            .collect(),
    ))
}

// ============================================================================
// Sending endpoints
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FastSender {
    ip: Option<String>,
    ip_suffix: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct LocalPrepareRequest {
    target_to: Option<String>,
    files: Option<HashMap<String, FileInfo>>,
    use_folder_upload: bool,
    folder_path: Option<PathBuf>,
    use_fast_sender: Option<FastSender>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PinParam {
    pin: Option<String>,
}

async fn resolve_target_peer(
    context: &Arc<ServiceContext>,
    request: &LocalPrepareRequest,
) -> Result<DiscoveredPeer, Error> {
    if let Some(fast) = &request.use_fast_sender {
        let ip: Ipv4Addr = if let Some(ip) = &fast.ip {
            ip.parse()
                .map_err(|_| Error::InvalidBody(format!("bad fast-sender ip: {ip}")))?
        } else if let Some(suffix) = fast.ip_suffix {
            let base = crate::netutil::primary_ipv4().ok_or(Error::NoInterface)?;
            let octets = base.octets();
            Ipv4Addr::new(octets[0], octets[1], octets[2], suffix)
        } else {
            return Err(Error::InvalidBody(
                "fast sender needs ip or ipSuffix".to_string(),
            ));
        };
        let port = {
            let config = context.config.read().expect("config lock poisoned");
            config.port
        };
        let (mut descriptor, scheme) = context.sender.fetch_device_info(ip, port).await?;
        descriptor.protocol = scheme;
        descriptor.port = port;
        return Ok(DiscoveredPeer { descriptor, ip });
    }

    let fingerprint = request
        .target_to
        .as_deref()
        .ok_or_else(|| Error::InvalidBody("targetTo or useFastSender required".to_string()))?;
    context
        .peers
        .get(fingerprint)
        .ok_or_else(|| Error::PeerNotFound(fingerprint.to_string()))
}

/// `POST /prepare-upload[?pin=…]`
pub(crate) async fn prepare_upload(
    State(context): State<Arc<ServiceContext>>,
    Query(params): Query<PinParam>,
    Json(request): Json<LocalPrepareRequest>,
) -> std::result::Result<Response, ApiFailure> {
    let peer = resolve_target_peer(&context, &request).await?;

    let mut paths: HashMap<String, PathBuf> = HashMap::new();
    let files: HashMap<String, FileInfo> = if request.use_folder_upload {
        let folder = request
            .folder_path
            .as_deref()
            .ok_or_else(|| Error::InvalidBody("folderPath required".to_string()))?;
        let entries = share::enumerate_folder(folder)?;
        entries
            .into_iter()
            .map(|entry| {
                paths.insert(entry.info.id.clone(), entry.path);
                (entry.info.id.clone(), entry.info)
            })
            .collect()
    } else {
        let mut files = request
            .files
            .clone()
            .ok_or_else(|| Error::InvalidBody("files required".to_string()))?;
        for (id, info) in &mut files {
            if info.id.is_empty() {
                info.id.clone_from(id);
            }
        }
        files
    };
    if files.is_empty() {
        return Err(ApiFailure(Error::InvalidBody("no files".to_string())));
    }

    let wire_request = context.sender.build_request(files.clone());
    let outcome = context
        .sender
        .prepare_upload(&peer, &wire_request, params.pin.as_deref())
        .await?;

    let Some(response) = outcome else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    context.outgoing.insert(OutgoingSession {
        peer,
        session_id: response.session_id.clone(),
        tokens: response.files.clone(),
        files,
        paths,
        cancel: CancellationToken::new(),
    });
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonUploadForm {
    session_id: String,
    file_id: String,
    #[serde(default)]
    token: Option<String>,
    file_url: String,
}

async fn body_from_file(path: &std::path::Path) -> Result<reqwest::Body, Error> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::FileNotFound(format!("{}: {e}", path.display())))?;
    Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
}

fn strip_file_url(input: &str) -> PathBuf {
    PathBuf::from(input.strip_prefix("file://").unwrap_or(input))
}

async fn send_one(
    context: &Arc<ServiceContext>,
    session: &OutgoingSession,
    file_id: &str,
    token: &str,
    body: reqwest::Body,
) -> Result<(), Error> {
    let _pause = ScanPause::hold(context.discovery.gate());
    context
        .sender
        .upload_file(
            &session.cancel,
            &session.peer,
            &session.session_id,
            file_id,
            token,
            body,
        )
        .await
}

/// `POST /upload`
///
/// Two forms: query `sessionId,fileId,token` with the raw bytes as the
/// body, or a JSON body whose `fileUrl` names a local file to stream.
pub(crate) async fn upload(
    State(context): State<Arc<ServiceContext>>,
    request: Request,
) -> std::result::Result<StatusCode, ApiFailure> {
    let (parts, body) = request.into_parts();
    let is_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    let (session_id, file_id, token, upload_body) = if is_json {
        let bytes = axum::body::to_bytes(body, 1024 * 1024)
            .await
            .map_err(|e| Error::InvalidBody(format!("body: {e}")))?;
        let form: JsonUploadForm =
            serde_json::from_slice(&bytes).map_err(|e| Error::InvalidBody(format!("json: {e}")))?;
        let path = strip_file_url(&form.file_url);
        let upload_body = body_from_file(&path).await?;
        (form.session_id, form.file_id, form.token, upload_body)
    } else {
        let Query(query) = Query::<UploadQuery>::try_from_uri(&parts.uri)
            .map_err(|e| Error::InvalidBody(format!("query: {e}")))?;
        let stream = body.into_data_stream();
        (
            query.session_id,
            query.file_id,
            Some(query.token),
            reqwest::Body::wrap_stream(stream),
        )
    };

    let session = context
        .outgoing
        .get(&session_id)
        .ok_or_else(|| Error::UnknownSession(session_id.clone()))?;
    let token = token
        .or_else(|| session.tokens.get(&file_id).cloned())
        .ok_or_else(|| Error::InvalidToken(file_id.clone()))?;

    send_one(&context, &session, &file_id, &token, upload_body).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct BatchRequest {
    session_id: String,
    files: Vec<BatchFile>,
    folder_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchFile {
    file_id: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchResult {
    file_id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /upload-batch` - sequential sends with cancel checks.
pub(crate) async fn upload_batch(
    State(context): State<Arc<ServiceContext>>,
    Json(request): Json<BatchRequest>,
) -> std::result::Result<(StatusCode, Json<Vec<BatchResult>>), ApiFailure> {
    let session = context
        .outgoing
        .get(&request.session_id)
        .ok_or_else(|| Error::UnknownSession(request.session_id.clone()))?;

    // A folder batch walks the paths captured at prepare time.
    let work: Vec<(String, Option<PathBuf>)> = if request.folder_path.is_some() {
        session
            .paths
            .iter()
            .map(|(id, path)| (id.clone(), Some(path.clone())))
            .collect()
    } else {
        request
            .files
            .iter()
            .map(|f| (f.file_id.clone(), f.file_url.as_deref().map(strip_file_url)))
            .collect()
    };

    let explicit_tokens: HashMap<&str, &str> = request
        .files
        .iter()
        .filter_map(|f| {
            f.token
                .as_deref()
                .map(|token| (f.file_id.as_str(), token))
        })
        .collect();

    let mut results = Vec::with_capacity(work.len());
    for (file_id, path) in work {
        if session.cancel.is_cancelled() {
            results.push(BatchResult {
                file_id,
                success: false,
                error: Some("cancelled".to_string()),
            });
            continue;
        }
        let outcome = async {
            let path = path
                .or_else(|| session.paths.get(&file_id).cloned())
                .ok_or_else(|| Error::FileNotFound(file_id.clone()))?;
            let token = explicit_tokens
                .get(file_id.as_str())
                .map(|t| (*t).to_string())
                .or_else(|| session.tokens.get(&file_id).cloned())
                .ok_or_else(|| Error::InvalidToken(file_id.clone()))?;
            let body = body_from_file(&path).await?;
            send_one(&context, &session, &file_id, &token, body).await
        }
        .await;
        results.push(match outcome {
            Ok(()) => BatchResult {
                file_id,
                success: true,
                error: None,
            },
            Err(e) => BatchResult {
                file_id,
                success: false,
                error: Some(e.to_string()),
            },
        });
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    let status = if succeeded == results.len() {
        context.outgoing.remove(&request.session_id);
        StatusCode::OK
    } else if succeeded > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(results)))
}

/// `POST /cancel` - cancel an outgoing session, telling the peer too.
pub(crate) async fn cancel(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<SessionQuery>,
) -> std::result::Result<StatusCode, ApiFailure> {
    let session = context
        .outgoing
        .cancel(&query.session_id)
        .ok_or_else(|| Error::UnknownSession(query.session_id.clone()))?;
    context
        .sender
        .cancel_session(&session.peer, &session.session_id)
        .await;
    Ok(StatusCode::OK)
}

// ============================================================================
// Confirmation endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfirmRecvQuery {
    session_id: String,
    confirmed: bool,
}

/// `GET /confirm-recv`
pub(crate) async fn confirm_recv(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<ConfirmRecvQuery>,
) -> Json<serde_json::Value> {
    let published = context.confirms.publish(&query.session_id, query.confirmed);
    Json(serde_json::json!({ "published": published }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfirmDownloadQuery {
    session_id: String,
    client_key: String,
    confirmed: bool,
}

/// `GET /confirm-download`
pub(crate) async fn confirm_download(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<ConfirmDownloadQuery>,
) -> Json<serde_json::Value> {
    let key = format!("download:{}:{}", query.session_id, query.client_key);
    let published = context.confirms.publish(&key, query.confirmed);
    Json(serde_json::json!({ "published": published }))
}

// ============================================================================
// Share endpoints
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateShareRequest {
    files: Vec<String>,
    pin: Option<String>,
    auto_accept: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ShareCreatedResponse {
    session_id: String,
    url: String,
}

/// `POST /create-share-session`
///
/// JSON bodies name local paths; multipart bodies carry the bytes,
/// which land under `share-uploads/<sessionId>/` and are deleted with
/// the session.
pub(crate) async fn create_share_session(
    State(context): State<Arc<ServiceContext>>,
    request: Request,
) -> std::result::Result<Json<ShareCreatedResponse>, ApiFailure> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/"));

    let (session_id, url) = if is_multipart {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| Error::InvalidBody(format!("multipart: {e}")))?;
        create_uploaded_share(&context, multipart).await?
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
            .await
            .map_err(|e| Error::InvalidBody(format!("body: {e}")))?;
        let body: CreateShareRequest =
            serde_json::from_slice(&bytes).map_err(|e| Error::InvalidBody(format!("json: {e}")))?;
        context
            .share
            .create_session(body.files, body.pin, body.auto_accept)
            .await?
    };

    Ok(Json(ShareCreatedResponse { session_id, url }))
}

async fn create_uploaded_share(
    context: &Arc<ServiceContext>,
    mut multipart: Multipart,
) -> Result<(String, String), Error> {
    let session_id = share::short_session_id();
    let dir = PathBuf::from("share-uploads").join(&session_id);
    tokio::fs::create_dir_all(&dir).await?;

    let mut entries = Vec::new();
    let mut pin: Option<String> = None;
    let mut auto_accept = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidBody(format!("multipart: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "pin" => {
                pin = field.text().await.ok().filter(|p| !p.is_empty());
            }
            "autoAccept" => {
                auto_accept = field
                    .text()
                    .await
                    .map(|v| v == "true")
                    .unwrap_or(false);
            }
            _ => {
                let file_name = field
                    .file_name()
                    .map_or_else(|| format!("file-{}", entries.len()), String::from);
                // Multipart names never carry directories.
                let safe_name = file_name.rsplit(['/', '\\']).next().unwrap_or("file").to_string();
                let target = dir.join(&safe_name);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidBody(format!("field: {e}")))?;
                tokio::fs::write(&target, &bytes).await?;
                entries.push(share::entry_for_upload(&target, safe_name)?);
            }
        }
    }

    context
        .share
        .create_session_owned(session_id, entries, dir, pin, auto_accept)
}

/// `DELETE /close-share-session`
pub(crate) async fn close_share_session(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<SessionQuery>,
) -> std::result::Result<StatusCode, ApiFailure> {
    context.share.close_session(&query.session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Config & favourites endpoints
// ============================================================================

/// `GET /config`
pub(crate) async fn get_config(State(context): State<Arc<ServiceContext>>) -> Json<ConfigView> {
    Json(config_view(&context))
}

/// `PATCH /config` - apply an allow-listed patch and persist it.
pub(crate) async fn patch_config(
    State(context): State<Arc<ServiceContext>>,
    Json(patch): Json<ConfigPatch>,
) -> std::result::Result<Json<ConfigView>, ApiFailure> {
    {
        let mut config = context.config.write().expect("config lock poisoned");
        config.apply_patch(&patch);
    }
    context.save_config()?;
    Ok(Json(config_view(&context)))
}

/// `GET /favorites`
pub(crate) async fn get_favorites(
    State(context): State<Arc<ServiceContext>>,
) -> Json<Vec<FavoriteDevice>> {
    let config = context.config.read().expect("config lock poisoned");
    Json(config.favorite_devices.clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddFavoriteRequest {
    fingerprint: String,
    #[serde(default)]
    alias: String,
}

/// `POST /favorites`
pub(crate) async fn add_favorite(
    State(context): State<Arc<ServiceContext>>,
    Json(request): Json<AddFavoriteRequest>,
) -> std::result::Result<Json<Vec<FavoriteDevice>>, ApiFailure> {
    if request.fingerprint.is_empty() {
        return Err(ApiFailure(Error::InvalidBody(
            "fingerprint required".to_string(),
        )));
    }
    {
        let mut config = context.config.write().expect("config lock poisoned");
        if !config
            .favorite_devices
            .iter()
            .any(|f| f.favorite_fingerprint == request.fingerprint)
        {
            config.favorite_devices.push(FavoriteDevice {
                favorite_fingerprint: request.fingerprint,
                favorite_alias: request.alias,
            });
        }
    }
    context.save_config()?;
    let config = context.config.read().expect("config lock poisoned");
    Ok(Json(config.favorite_devices.clone()))
}

// ============================================================================
// WebSocket notifications
// ============================================================================

/// `GET /ws` - stream notifications to a UI.
pub(crate) async fn ws_notifications(
    State(context): State<Arc<ServiceContext>>,
    ConnectInfo(_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let mut feed = context.notifier.hub().register();
        let (mut sink, mut source) = socket.split();
        loop {
            tokio::select! {
                outgoing = feed.recv() => {
                    match outgoing {
                        Some(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = source.next() => {
                    // Clients only listen; any close or error ends the feed.
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    })
}
