//! HTTP/S server: routes, TLS, and middleware.
//!
//! One listener serves three route families:
//!
//! - `/api/localsend/v2/*` - the peer-facing protocol
//! - `/api/localsend/v1/*` - legacy acceptance
//! - `/api/self/v1/*` - the management API, restricted to loopback
//!
//! The management routes get permissive CORS (they are loopback-only
//! anyway); everything sits behind a catch-panic layer so one broken
//! request cannot take the listener down.

mod api;
mod v1;
mod v2;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

use crate::context::ServiceContext;
use crate::error::{Error, Result};
use crate::protocol::{Scheme, WireError};

/// Peer-facing error response: protocol status code plus `{error}` body.
pub(crate) struct PeerFailure(pub Error);

impl IntoResponse for PeerFailure {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.peer_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = WireError {
            error: self.0.wire_code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for PeerFailure {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Management-API error response: local status mapping, full message.
pub(crate) struct ApiFailure(pub Error);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidBody(_)
            | Error::InvalidPath(_)
            | Error::FileNotFound(_)
            | Error::UnknownSession(_)
            | Error::PeerNotFound(_) => StatusCode::BAD_REQUEST,
            Error::PinRequired | Error::InvalidPin => StatusCode::UNAUTHORIZED,
            Error::Rejected => StatusCode::FORBIDDEN,
            Error::BlockedByOther => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = WireError {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiFailure {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Reject management calls from anywhere but this machine.
async fn require_loopback(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback(),
    };
    if allowed {
        next.run(request).await
    } else {
        let body = WireError {
            error: "management API is local-only".to_string(),
        };
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

/// Assemble the full route tree.
pub fn build_router(context: Arc<ServiceContext>) -> Router {
    let download_enabled = {
        let config = context.config.read().expect("config lock poisoned");
        config.download
    };

    let mut v2_routes = Router::new()
        .route("/info", get(v2::info))
        .route("/register", post(v2::register))
        .route("/prepare-upload", post(v2::prepare_upload))
        .route("/upload", post(v2::upload))
        .route("/cancel", post(v2::cancel));
    if download_enabled {
        v2_routes = v2_routes
            .route("/prepare-download", get(v2::prepare_download))
            .route("/download", get(v2::download));
    }

    let v1_routes = Router::new()
        .route("/info", get(v1::info))
        .route("/send-request", post(v1::send_request))
        .route("/send", post(v1::send))
        .route("/cancel", post(v1::cancel));

    let self_routes = Router::new()
        .route("/scan-current", get(api::scan_current))
        .route("/scan-now", get(api::scan_now))
        .route("/get-network-info", get(api::network_info))
        .route("/prepare-upload", post(api::prepare_upload))
        .route("/upload", post(api::upload))
        .route("/upload-batch", post(api::upload_batch))
        .route("/cancel", post(api::cancel))
        .route("/confirm-recv", get(api::confirm_recv))
        .route("/confirm-download", get(api::confirm_download))
        .route("/create-share-session", post(api::create_share_session))
        .route("/close-share-session", delete(api::close_share_session))
        .route("/config", get(api::get_config).patch(api::patch_config))
        .route("/favorites", get(api::get_favorites).post(api::add_favorite))
        .route("/ws", get(api::ws_notifications))
        .layer(middleware::from_fn(require_loopback))
        .layer(CorsLayer::permissive());

    Router::new()
        .nest("/api/localsend/v2", v2_routes)
        .nest("/api/localsend/v1", v1_routes)
        .nest("/api/self/v1", self_routes)
        .layer(CatchPanicLayer::new())
        .with_state(context)
}

/// Run the listener until shutdown.
///
/// HTTPS uses the context's generated identity; the HTTP fall-through
/// serves the same routes in the clear for nodes configured that way.
pub async fn serve(context: Arc<ServiceContext>) -> Result<()> {
    let (port, scheme) = {
        let config = context.config.read().expect("config lock poisoned");
        (config.port, config.protocol)
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let router = build_router(Arc::clone(&context));
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    let handle = Handle::new();
    {
        let handle = handle.clone();
        let shutdown = context.shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });
    }

    match scheme {
        Scheme::Https => {
            let identity = context
                .identity
                .as_ref()
                .ok_or_else(|| Error::Tls("https configured without identity".to_string()))?;
            let tls = RustlsConfig::from_pem(
                identity.cert_pem.clone().into_bytes(),
                identity.key_pem.clone().into_bytes(),
            )
            .await
            .map_err(|e| Error::Tls(format!("tls config: {e}")))?;
            tracing::info!("serving https on {addr}");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(service)
                .await
                .map_err(|e| Error::Transport(format!("server: {e}")))
        }
        Scheme::Http => {
            tracing::info!("serving http on {addr}");
            axum_server::bind(addr)
                .handle(handle)
                .serve(service)
                .await
                .map_err(|e| Error::Transport(format!("server: {e}")))
        }
    }
}
