//! LocalSend v2 wire protocol types.
//!
//! Everything that crosses the wire is JSON with camelCase field names;
//! the structs here are the single source of truth for serialisation.
//! Legacy v1 bodies are parsed with the same types: every field a v1
//! client may omit carries a serde default.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version advertised by this node.
pub const PROTOCOL_VERSION: &str = "2.1";

/// Standard LocalSend TCP/UDP port.
pub const DEFAULT_PORT: u16 = 53317;

/// Multicast group for UDP discovery.
pub const MULTICAST_GROUP: [u8; 4] = [224, 0, 0, 167];

/// Transport scheme a peer serves its API on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP
    Http,
    /// HTTPS with a self-signed certificate
    #[default]
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// Device category tag carried in discovery messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Phone or tablet
    Mobile,
    /// Desktop or laptop
    Desktop,
    /// Browser client
    Web,
    /// Headless node (the default for this implementation)
    #[default]
    Headless,
    /// Always-on server
    Server,
}

/// Semantic identity of a node as exchanged on every discovery and
/// handshake path.
///
/// A peer whose `fingerprint` equals the local one is always ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceDescriptor {
    /// Human-readable device name
    pub alias: String,
    /// Protocol version string, e.g. "2.1"
    pub version: String,
    /// Free-form model tag, e.g. "Linux"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    /// Device category
    pub device_type: DeviceKind,
    /// Stable identity: hex prefix of SHA-256 over the TLS cert DER
    pub fingerprint: String,
    /// TCP port the peer's API listens on
    pub port: u16,
    /// Scheme the peer's API is served on
    pub protocol: Scheme,
    /// Whether the peer publishes the reverse-download API
    pub download: bool,
    /// Whether the sender of this message wants a reply
    pub announce: bool,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            alias: String::new(),
            version: PROTOCOL_VERSION.to_string(),
            device_model: None,
            device_type: DeviceKind::default(),
            fingerprint: String::new(),
            port: DEFAULT_PORT,
            protocol: Scheme::default(),
            download: false,
            announce: false,
        }
    }
}

impl DeviceDescriptor {
    /// Copy of this descriptor with the `announce` flag set.
    #[must_use]
    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }
}

/// Metadata a sender may attach to a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMeta {
    /// Last-modified timestamp (RFC 3339) if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    /// Last-accessed timestamp (RFC 3339) if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed: Option<String>,
}

/// Per-file descriptor inside a prepare-upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileInfo {
    /// Sender-chosen file id, unique within the request
    pub id: String,
    /// File name, possibly slash-delimited to convey folder structure
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    pub file_type: String,
    /// Hex SHA-256 of the content, if the sender computed one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Inline preview (full text for text messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Optional timestamps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMeta>,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            file_name: String::new(),
            size: 0,
            file_type: "application/octet-stream".to_string(),
            sha256: None,
            preview: None,
            metadata: None,
        }
    }
}

impl FileInfo {
    /// Whether this entry is a plain-text message rather than a file.
    ///
    /// True when the type is `text/plain` (case-insensitive, trimmed)
    /// and an inline preview is present.
    #[must_use]
    pub fn is_text_message(&self) -> bool {
        self.file_type.trim().eq_ignore_ascii_case("text/plain")
            && self.preview.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Body of `POST /api/localsend/v2/prepare-upload` (and v1 send-request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareUploadRequest {
    /// Sender identity
    pub info: DeviceDescriptor,
    /// Offered files, keyed by file id
    pub files: HashMap<String, FileInfo>,
}

/// Successful prepare-upload response: the session and one token per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadResponse {
    /// Receiver-issued session id
    pub session_id: String,
    /// fileId → upload token
    pub files: HashMap<String, String>,
}

/// Query parameters of `POST /api/localsend/v2/upload`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    /// Session issued by prepare-upload
    pub session_id: String,
    /// File being uploaded
    pub file_id: String,
    /// Token issued for that file
    pub token: String,
}

/// Query parameters naming just a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    /// Target session id
    pub session_id: String,
}

/// Query parameters of `GET /api/localsend/v2/prepare-download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDownloadQuery {
    /// Share session id
    pub session_id: String,
    /// PIN, when the share requires one
    #[serde(default)]
    pub pin: Option<String>,
}

/// Query parameters of `GET /api/localsend/v2/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    /// Share session id
    pub session_id: String,
    /// File to fetch
    pub file_id: String,
}

/// Successful prepare-download response: publisher identity and listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDownloadResponse {
    /// Publisher identity
    pub info: DeviceDescriptor,
    /// Share session id
    pub session_id: String,
    /// Published files, keyed by file id
    pub files: HashMap<String, FileInfo>,
}

/// `202` body while a download awaits the publisher's confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingResponse {
    /// Always `waiting_confirmation`
    pub status: String,
}

impl WaitingResponse {
    /// The pending-confirmation marker body.
    #[must_use]
    pub fn waiting() -> Self {
        Self {
            status: "waiting_confirmation".to_string(),
        }
    }
}

/// Peer-facing JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Short machine-matchable error string
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            alias: "Test Node".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            device_model: Some("Linux".to_string()),
            device_type: DeviceKind::Headless,
            fingerprint: "ab".repeat(16),
            port: 53317,
            protocol: Scheme::Https,
            download: true,
            announce: true,
        }
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let original = descriptor();
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: DeviceDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_descriptor_wire_names_are_camel_case() {
        let json = serde_json::to_string(&descriptor()).expect("serialize");
        assert!(json.contains("\"deviceModel\""));
        assert!(json.contains("\"deviceType\":\"headless\""));
        assert!(json.contains("\"protocol\":\"https\""));
        assert!(!json.contains("device_model"));
    }

    #[test]
    fn test_partial_descriptor_parses_with_defaults() {
        // A v1 client omits most fields.
        let parsed: DeviceDescriptor =
            serde_json::from_str(r#"{"alias":"Old Phone","deviceType":"mobile"}"#)
                .expect("deserialize");
        assert_eq!(parsed.alias, "Old Phone");
        assert_eq!(parsed.device_type, DeviceKind::Mobile);
        assert_eq!(parsed.port, DEFAULT_PORT);
        assert!(!parsed.announce);
    }

    #[test]
    fn test_text_message_detection() {
        let mut info = FileInfo {
            id: "f1".to_string(),
            file_name: "message.txt".to_string(),
            size: 5,
            file_type: " Text/Plain ".to_string(),
            preview: Some("hello".to_string()),
            ..FileInfo::default()
        };
        assert!(info.is_text_message());

        info.preview = Some(String::new());
        assert!(!info.is_text_message());

        info.preview = Some("hello".to_string());
        info.file_type = "image/png".to_string();
        assert!(!info.is_text_message());
    }

    #[test]
    fn test_prepare_upload_request_parses() {
        let body = r#"{
            "info": {"alias":"A","fingerprint":"ff","deviceType":"desktop"},
            "files": {"f1": {"id":"f1","fileName":"a.txt","size":11,"fileType":"text/plain"}}
        }"#;
        let request: PrepareUploadRequest = serde_json::from_str(body).expect("deserialize");
        assert_eq!(request.files.len(), 1);
        assert_eq!(request.files["f1"].file_name, "a.txt");
        assert_eq!(request.info.alias, "A");
    }

    #[test]
    fn test_waiting_response_shape() {
        let json = serde_json::to_string(&WaitingResponse::waiting()).expect("serialize");
        assert_eq!(json, r#"{"status":"waiting_confirmation"}"#);
    }
}
