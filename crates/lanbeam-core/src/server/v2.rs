//! Peer-facing LocalSend v2 handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::io::ReaderStream;

use super::PeerFailure;
use crate::context::ServiceContext;
use crate::discovery::ScanPause;
use crate::error::{Error, Result};
use crate::notify::Notification;
use crate::protocol::{
    DeviceDescriptor, DownloadQuery, PrepareDownloadQuery, PrepareUploadRequest, SessionQuery,
    UploadQuery, WaitingResponse,
};
use crate::receive::{persist_stream, resolve_target};
use crate::share::DownloadGate;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct PinQuery {
    pub pin: Option<String>,
}

/// `GET /api/localsend/v2/info`
pub(crate) async fn info(State(context): State<Arc<ServiceContext>>) -> Json<DeviceDescriptor> {
    let config = context.config.read().expect("config lock poisoned");
    Json(config.descriptor())
}

/// `POST /api/localsend/v2/register` - pairwise handshake.
pub(crate) async fn register(
    State(context): State<Arc<ServiceContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(descriptor): Json<DeviceDescriptor>,
) -> Json<DeviceDescriptor> {
    if let std::net::IpAddr::V4(ip) = addr.ip() {
        let scheme = descriptor.protocol;
        context.discovery.record_observation(descriptor, ip, scheme).await;
    }
    let config = context.config.read().expect("config lock poisoned");
    Json(config.descriptor())
}

/// `POST /api/localsend/v2/prepare-upload`
pub(crate) async fn prepare_upload(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<PinQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<PrepareUploadRequest>,
) -> std::result::Result<Response, PeerFailure> {
    let outcome = context
        .receiver
        .handle_prepare_upload(&request, query.pin.as_deref(), addr.ip())
        .await?;
    Ok(match outcome {
        // Text-received shortcut: nothing touches the disk.
        None => StatusCode::NO_CONTENT.into_response(),
        Some(response) => Json(response).into_response(),
    })
}

/// `POST /api/localsend/v2/upload`
pub(crate) async fn upload(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<UploadQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Body,
) -> std::result::Result<StatusCode, PeerFailure> {
    receive_file(
        &context,
        &query.session_id,
        &query.file_id,
        &query.token,
        addr.ip(),
        body,
    )
    .await?;
    Ok(StatusCode::OK)
}

/// `POST /api/localsend/v2/cancel`
pub(crate) async fn cancel(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<SessionQuery>,
) -> std::result::Result<StatusCode, PeerFailure> {
    cancel_session(&context, &query.session_id).await;
    Ok(StatusCode::OK)
}

/// Cancel a receiving session and settle its notifications.
///
/// One notification per cancellation: a started session owes its
/// single `upload_end` (everything unfinished counts as failed), a
/// session cancelled before any file began gets `upload_cancelled`.
pub(crate) async fn cancel_session(context: &Arc<ServiceContext>, session_id: &str) {
    let Some((stats, started)) = context.uploads.cancel_session(session_id) else {
        return;
    };
    let note = if started {
        let failed = stats.total_files - stats.success_files;
        Notification::upload_end(
            session_id,
            stats.success_files,
            failed,
            &stats.failed_file_ids,
            &stats.file_names,
            &stats.saved_file_names,
            &stats.save_paths,
        )
    } else {
        Notification::upload_cancelled(session_id)
    };
    let _ = context.notifier.send(&note).await;
}

/// The verified streaming receive shared by v2 `upload` and v1 `send`.
pub(crate) async fn receive_file(
    context: &Arc<ServiceContext>,
    session_id: &str,
    file_id: &str,
    token: &str,
    source_ip: std::net::IpAddr,
    body: Body,
) -> Result<()> {
    let grant = context
        .uploads
        .begin_upload(session_id, file_id, token, source_ip)?;

    // Transfers own the bandwidth: scanning skips until the guard drops.
    let _pause = ScanPause::hold(context.discovery.gate());

    if grant.first_file {
        let note = Notification::upload_start(session_id, grant.total_files);
        let _ = context.notifier.send(&note).await;
    }

    let (upload_root, flat) = {
        let config = context.config.read().expect("config lock poisoned");
        (
            config.upload_dir.clone(),
            config.do_not_make_session_folder,
        )
    };

    let write_result = match resolve_target(&upload_root, session_id, &grant.info.file_name, flat) {
        Ok(target) => persist_stream(
            &target,
            body.into_data_stream(),
            grant.info.size,
            grant.info.sha256.as_deref(),
            &grant.cancel,
        )
        .await
        .map(|_written| target),
        Err(e) => Err(e),
    };

    let (success, saved, failure) = match write_result {
        Ok(target) => {
            let saved_name = target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (true, Some((saved_name, target)), None)
        }
        Err(e) => (false, None, Some(e)),
    };

    let report = match context
        .uploads
        .mark_file_done(session_id, file_id, success, saved)
    {
        Ok(report) => report,
        Err(_) => {
            // The session vanished under us (concurrent cancel); the
            // cancel path owns the notifications.
            return failure.map_or(Ok(()), Err);
        }
    };

    if report.is_last {
        let stats = report.stats;
        let session = session_id.to_string();
        let notifier = context.notifier.clone();
        tokio::spawn(async move {
            let note = Notification::upload_end(
                &session,
                stats.success_files,
                stats.failed_files,
                &stats.failed_file_ids,
                &stats.file_names,
                &stats.saved_file_names,
                &stats.save_paths,
            );
            let _ = notifier.send(&note).await;
        });
    } else {
        let note = Notification::upload_progress(
            session_id,
            report.remaining,
            report.stats.success_files,
            report.stats.failed_files,
        );
        let _ = context.notifier.send(&note).await;
    }

    failure.map_or(Ok(()), Err)
}

/// `GET /api/localsend/v2/prepare-download`
pub(crate) async fn prepare_download(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<PrepareDownloadQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> std::result::Result<Response, PeerFailure> {
    let client_key = addr.ip().to_string();
    let gate = context
        .share
        .prepare_download(&query.session_id, query.pin.as_deref(), &client_key)
        .await?;
    Ok(match gate {
        DownloadGate::Listing(listing) => Json(*listing).into_response(),
        DownloadGate::Waiting => {
            (StatusCode::ACCEPTED, Json(WaitingResponse::waiting())).into_response()
        }
    })
}

/// `GET /api/localsend/v2/download`
pub(crate) async fn download(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<DownloadQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> std::result::Result<Response, PeerFailure> {
    let client_key = addr.ip().to_string();
    let entry = context
        .share
        .file_for_download(&query.session_id, &query.file_id, &client_key)?;

    let file = tokio::fs::File::open(&entry.path)
        .await
        .map_err(|e| Error::FileNotFound(format!("{}: {e}", entry.path.display())))?;

    // The pause guard rides inside the stream so scanning stays off
    // for as long as bytes are flowing.
    let pause = ScanPause::hold(context.discovery.gate());
    let stream = {
        use futures::StreamExt;
        ReaderStream::new(file).map(move |chunk| {
            let _hold = &pause;
            chunk
        })
    };

    let file_name = entry
        .info
        .file_name
        .rsplit('/')
        .next()
        .unwrap_or(&entry.info.file_name)
        .to_string();
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, entry.info.file_type.clone())
        .header(header::CONTENT_LENGTH, entry.info.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("response: {e}")))?;
    Ok(response)
}
