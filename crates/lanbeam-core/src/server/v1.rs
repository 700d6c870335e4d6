//! Legacy v1 acceptance handlers.
//!
//! v1 clients carry no session id after the handshake, so the session
//! is re-derived from the client's source address on every call. The
//! gate sequence is the v2 one; only the wire shapes differ
//! (`send-request` answers with the bare token map).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::v2::{cancel_session, receive_file, PinQuery};
use super::PeerFailure;
use crate::context::ServiceContext;
use crate::error::Error;
use crate::protocol::{DeviceDescriptor, PrepareUploadRequest};

/// `GET /api/localsend/v1/info`
pub(crate) async fn info(State(context): State<Arc<ServiceContext>>) -> Json<DeviceDescriptor> {
    let config = context.config.read().expect("config lock poisoned");
    Json(config.descriptor())
}

/// `POST /api/localsend/v1/send-request`
///
/// Same gates as v2 prepare-upload; the response body is the token map
/// without the session wrapper, and the session is remembered against
/// the caller's address.
pub(crate) async fn send_request(
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
        None => StatusCode::NO_CONTENT.into_response(),
        Some(response) => {
            context.uploads.bind_v1(addr.ip(), &response.session_id);
            Json(response.files).into_response()
        }
    })
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct V1SendQuery {
    file_id: String,
    token: String,
}

/// `POST /api/localsend/v1/send`
pub(crate) async fn send(
    State(context): State<Arc<ServiceContext>>,
    Query(query): Query<V1SendQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Body,
) -> std::result::Result<StatusCode, PeerFailure> {
    let session_id = context
        .uploads
        .v1_session(addr.ip())
        .ok_or_else(|| Error::UnknownSession(addr.ip().to_string()))?;
    receive_file(
        &context,
        &session_id,
        &query.file_id,
        &query.token,
        addr.ip(),
        body,
    )
    .await?;
    Ok(StatusCode::OK)
}

/// `POST /api/localsend/v1/cancel` - no body, session from the address.
pub(crate) async fn cancel(
    State(context): State<Arc<ServiceContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> StatusCode {
    if let Some(session_id) = context.uploads.v1_session(addr.ip()) {
        cancel_session(&context, &session_id).await;
    }
    StatusCode::OK
}
