//! HTTP client for the sending side of the protocol.
//!
//! Wraps one `reqwest` client configured for the LAN trust model:
//! peers present self-signed certificates, so verification is off and
//! identity comes from fingerprints exchanged in the bodies. Upload
//! calls are scoped to a cancellation token; once the token fires, the
//! outcome is reported as [`Error::Cancelled`], never as the transport
//! error the abort produced.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::discovery::peers::DiscoveredPeer;
use crate::error::{Error, Result};
use crate::protocol::{
    DeviceDescriptor, PrepareUploadRequest, PrepareUploadResponse, Scheme, WireError,
};

/// Connect timeout for peer requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall timeout for small negotiation requests.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared peer-facing HTTP client.
///
/// `bind_addr` pins outbound dials to a concrete interface address
/// when the configuration names one.
pub fn build_http_client(bind_addr: Option<Ipv4Addr>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(addr) = bind_addr {
        builder = builder.local_address(std::net::IpAddr::V4(addr));
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))
}

/// Sending-side protocol client.
#[derive(Clone)]
pub struct SenderClient {
    client: reqwest::Client,
    descriptor: DeviceDescriptor,
}

impl SenderClient {
    /// Create a client sending as `descriptor`.
    #[must_use]
    pub fn new(client: reqwest::Client, descriptor: DeviceDescriptor) -> Self {
        Self { client, descriptor }
    }

    /// The underlying HTTP client (shared with the sweep scanner).
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Negotiate an upload session with a peer.
    ///
    /// Returns `None` on 204 (text-received shortcut: nothing to
    /// upload) and the parsed session otherwise. A 200 body missing
    /// the session id or token map is a peer error.
    pub async fn prepare_upload(
        &self,
        peer: &DiscoveredPeer,
        request: &PrepareUploadRequest,
        pin: Option<&str>,
    ) -> Result<Option<PrepareUploadResponse>> {
        let mut url = format!("{}/api/localsend/v2/prepare-upload", peer.base_url());
        if let Some(pin) = pin {
            url = format!("{url}?pin={pin}");
        }
        let response = self
            .client
            .post(&url)
            .timeout(NEGOTIATE_TIMEOUT)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            204 => Ok(None),
            200 => {
                let parsed: PrepareUploadResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::PeerError(format!("prepare-upload body: {e}")))?;
                if parsed.session_id.is_empty() || parsed.files.is_empty() {
                    return Err(Error::PeerError(
                        "prepare-upload response missing session or tokens".to_string(),
                    ));
                }
                Ok(Some(parsed))
            }
            400 => Err(Error::InvalidBody("peer rejected request body".to_string())),
            401 => {
                // Disambiguate which PIN failure via the body.
                let body = response.text().await.unwrap_or_default();
                let wire: Option<WireError> = serde_json::from_str(&body).ok();
                match wire {
                    Some(w) if w.error.to_lowercase().contains("invalid") => {
                        Err(Error::InvalidPin)
                    }
                    _ => Err(Error::PinRequired),
                }
            }
            403 => Err(Error::Rejected),
            409 => Err(Error::BlockedByOther),
            429 => Err(Error::TooManyRequests),
            _ => Err(Error::PeerError(format!("prepare-upload: {status}"))),
        }
    }

    /// Stream one file's bytes to the peer.
    ///
    /// Aborts when `cancel` fires; the result is then [`Error::Cancelled`]
    /// regardless of how the aborted transport call failed.
    pub async fn upload_file(
        &self,
        cancel: &CancellationToken,
        peer: &DiscoveredPeer,
        session_id: &str,
        file_id: &str,
        token: &str,
        body: reqwest::Body,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let url = format!(
            "{}/api/localsend/v2/upload?sessionId={session_id}&fileId={file_id}&token={token}",
            peer.base_url()
        );
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send();

        let outcome = tokio::select! {
            response = request => response.map_err(Error::from),
            () = cancel.cancelled() => Err(Error::Cancelled),
        };

        match outcome {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(Error::PeerError(format!("upload: {}", response.status()))),
            Err(e) => {
                // The abort races the transport error; cancellation wins.
                if cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Best-effort session cancel on the peer.
    pub async fn cancel_session(&self, peer: &DiscoveredPeer, session_id: &str) {
        let url = format!(
            "{}/api/localsend/v2/cancel?sessionId={session_id}",
            peer.base_url()
        );
        if let Err(e) = self
            .client
            .post(&url)
            .timeout(NEGOTIATE_TIMEOUT)
            .send()
            .await
        {
            tracing::debug!("cancel at {}: {e}", peer.ip);
        }
    }

    /// Fetch a device's descriptor directly, HTTPS first then HTTP.
    ///
    /// Used by the fast-sender path to skip the discovery cache.
    /// Returns the descriptor and the scheme that answered.
    pub async fn fetch_device_info(
        &self,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<(DeviceDescriptor, Scheme)> {
        let mut last_error = Error::Transport("unreachable".to_string());
        for scheme in [Scheme::Https, Scheme::Http] {
            let url = format!("{scheme}://{ip}:{port}/api/localsend/v2/info");
            match self
                .client
                .get(&url)
                .timeout(NEGOTIATE_TIMEOUT)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let descriptor: DeviceDescriptor = response
                        .json()
                        .await
                        .map_err(|e| Error::PeerError(format!("info body: {e}")))?;
                    return Ok((descriptor, scheme));
                }
                Ok(response) => {
                    last_error = Error::PeerError(format!("info: {}", response.status()));
                }
                Err(e) => last_error = Error::from(e),
            }
        }
        Err(last_error)
    }

    /// The descriptor this client negotiates as.
    #[must_use]
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Build a prepare-upload request offering `files`.
    #[must_use]
    pub fn build_request(
        &self,
        files: HashMap<String, crate::protocol::FileInfo>,
    ) -> PrepareUploadRequest {
        PrepareUploadRequest {
            info: self.descriptor.clone().with_announce(false),
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileInfo;

    fn client() -> SenderClient {
        SenderClient::new(
            build_http_client(None).expect("client"),
            DeviceDescriptor {
                alias: "sender".to_string(),
                fingerprint: "cd".repeat(16),
                ..DeviceDescriptor::default()
            },
        )
    }

    fn unreachable_peer() -> DiscoveredPeer {
        DiscoveredPeer {
            descriptor: DeviceDescriptor {
                protocol: Scheme::Http,
                // Port 9 (discard) is never an API listener.
                port: 9,
                ..DeviceDescriptor::default()
            },
            ip: Ipv4Addr::LOCALHOST,
        }
    }

    #[test]
    fn test_build_request_never_announces() {
        let request = client().build_request(HashMap::from([(
            "f1".to_string(),
            FileInfo {
                id: "f1".to_string(),
                file_name: "a.txt".to_string(),
                size: 1,
                ..FileInfo::default()
            },
        )]));
        assert!(!request.info.announce);
        assert_eq!(request.files.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_with_cancelled_context_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client()
            .upload_file(
                &cancel,
                &unreachable_peer(),
                "s1",
                "f1",
                "t1",
                reqwest::Body::from("data"),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_upload_transport_error_without_cancel_is_transport() {
        let cancel = CancellationToken::new();
        let err = client()
            .upload_file(
                &cancel,
                &unreachable_peer(),
                "s1",
                "f1",
                "t1",
                reqwest::Body::from("data"),
            )
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_session_is_best_effort() {
        // Must not panic or error against a dead peer.
        client().cancel_session(&unreachable_peer(), "s1").await;
    }
}
