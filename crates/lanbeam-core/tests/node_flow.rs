//! End-to-end tests against a live node.
//!
//! Each test boots the real route tree on an ephemeral loopback port
//! and drives it with a plain HTTP client, covering the transfer
//! scenarios a peer would exercise: the happy path, the PIN gate,
//! rejection, token validation, cancellation, the legacy v1 flow, the
//! text-message shortcut, and reverse downloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use lanbeam_core::config::Config;
use lanbeam_core::context::ServiceContext;
use lanbeam_core::protocol::Scheme;
use lanbeam_core::server;

struct Node {
    context: Arc<ServiceContext>,
    addr: SocketAddr,
    _server: tokio::task::JoinHandle<()>,
}

impl Node {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn start_node(mut config: Config, dir: &TempDir) -> Node {
    config.protocol = Scheme::Http;
    config.upload_dir = dir.path().join("uploads");
    config.notify_socket = String::new();

    let context =
        ServiceContext::initialise(config, dir.path().join("config.yaml")).expect("context");
    let router = server::build_router(Arc::clone(&context));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    Node {
        context,
        addr,
        _server: server,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn prepare_body(files: &[(&str, &str, &[u8])]) -> serde_json::Value {
    let mut file_map = serde_json::Map::new();
    for (id, name, content) in files {
        file_map.insert(
            (*id).to_string(),
            serde_json::json!({
                "id": id,
                "fileName": name,
                "size": content.len(),
                "fileType": "application/octet-stream",
                "sha256": sha256_hex(content),
            }),
        );
    }
    serde_json::json!({
        "info": {
            "alias": "Peer A",
            "version": "2.1",
            "deviceType": "desktop",
            "fingerprint": "aa".repeat(16),
        },
        "files": file_map,
    })
}

/// Spawn a task that answers the next confirmation prompt.
fn auto_answer(context: &Arc<ServiceContext>, decision: bool) -> tokio::task::JoinHandle<()> {
    let confirms = context.confirms.clone();
    tokio::spawn(async move {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(key) = confirms.pending_keys().into_iter().next() {
                confirms.publish(&key, decision);
                return;
            }
        }
    })
}

#[tokio::test]
async fn test_happy_path_single_file() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();
    let content = b"hello world";

    // Watch notifications through the WebSocket hub.
    let mut feed = node.context.notifier.hub().register();

    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[("f1", "a.txt", content)]))
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 200);
    let prepared: serde_json::Value = response.json().await.expect("json");
    let session_id = prepared["sessionId"].as_str().expect("session").to_string();
    let token = prepared["files"]["f1"].as_str().expect("token").to_string();

    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/upload?sessionId={session_id}&fileId=f1&token={token}"
        )))
        .header("content-type", "application/octet-stream")
        .body(content.to_vec())
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), 200);

    let saved = dir.path().join("uploads").join(&session_id).join("a.txt");
    assert_eq!(std::fs::read(&saved).expect("saved file"), content);

    // upload_start strictly precedes the single upload_end.
    let first: serde_json::Value =
        serde_json::from_str(&feed.recv().await.expect("start note")).unwrap();
    assert_eq!(first["type"], "upload_start");
    let second: serde_json::Value =
        serde_json::from_str(&feed.recv().await.expect("end note")).unwrap();
    assert_eq!(second["type"], "upload_end");
    assert_eq!(second["data"]["successFiles"], 1);
    assert_eq!(second["data"]["failedFiles"], 0);
}

#[tokio::test]
async fn test_pin_gate_then_success() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.pin = "1234".to_string();
    let node = start_node(config, &dir).await;
    let client = reqwest::Client::new();
    let body = prepare_body(&[("f1", "a.txt", b"data")]);

    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&body)
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 401);

    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload?pin=9999"))
        .json(&body)
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 401);

    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload?pin=1234"))
        .json(&body)
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_user_rejection_leaves_no_session() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.auto_save = false;
    let node = start_node(config, &dir).await;
    let client = reqwest::Client::new();

    let answer = auto_answer(&node.context, false);
    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[("f1", "a.txt", b"data")]))
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 403);
    answer.await.unwrap();

    // Nothing persisted, nothing pending.
    assert!(!dir.path().join("uploads").exists());
}

#[tokio::test]
async fn test_confirmed_transfer_after_prompt() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.auto_save = false;
    let node = start_node(config, &dir).await;
    let client = reqwest::Client::new();

    let answer = auto_answer(&node.context, true);
    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[("f1", "a.txt", b"data")]))
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 200);
    answer.await.unwrap();
}

#[tokio::test]
async fn test_wrong_token_is_forbidden() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();

    let prepared: serde_json::Value = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[("f1", "a.txt", b"data")]))
        .send()
        .await
        .expect("prepare")
        .json()
        .await
        .expect("json");
    let session_id = prepared["sessionId"].as_str().unwrap();

    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/upload?sessionId={session_id}&fileId=f1&token=forged"
        )))
        .body("data".to_string())
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_integrity_failure_removes_file_and_ends_session() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();
    let mut feed = node.context.notifier.hub().register();

    let prepared: serde_json::Value = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[("f1", "a.txt", b"expected content")]))
        .send()
        .await
        .expect("prepare")
        .json()
        .await
        .expect("json");
    let session_id = prepared["sessionId"].as_str().unwrap().to_string();
    let token = prepared["files"]["f1"].as_str().unwrap().to_string();

    // Wrong bytes: size matches nothing declared, hash cannot.
    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/upload?sessionId={session_id}&fileId=f1&token={token}"
        )))
        .body("unexpected bytes!".to_string())
        .send()
        .await
        .expect("upload");
    assert_ne!(response.status(), 200);

    let saved = dir.path().join("uploads").join(&session_id).join("a.txt");
    assert!(!saved.exists(), "failed file must not remain on disk");

    // upload_start then upload_end with failed=1.
    let first: serde_json::Value =
        serde_json::from_str(&feed.recv().await.expect("start")).unwrap();
    assert_eq!(first["type"], "upload_start");
    let second: serde_json::Value =
        serde_json::from_str(&feed.recv().await.expect("end")).unwrap();
    assert_eq!(second["type"], "upload_end");
    assert_eq!(second["data"]["failedFiles"], 1);
}

#[tokio::test]
async fn test_cancel_removes_session_and_notifies() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();
    let mut feed = node.context.notifier.hub().register();

    let content = b"first file";
    let prepared: serde_json::Value = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&prepare_body(&[
            ("f1", "one.bin", content),
            ("f2", "two.bin", b"second file"),
        ]))
        .send()
        .await
        .expect("prepare")
        .json()
        .await
        .expect("json");
    let session_id = prepared["sessionId"].as_str().unwrap().to_string();
    let token1 = prepared["files"]["f1"].as_str().unwrap().to_string();
    let token2 = prepared["files"]["f2"].as_str().unwrap().to_string();

    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/upload?sessionId={session_id}&fileId=f1&token={token1}"
        )))
        .body(content.to_vec())
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), 200);

    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/cancel?sessionId={session_id}"
        )))
        .send()
        .await
        .expect("cancel");
    assert_eq!(response.status(), 200);

    // The second file can no longer be uploaded.
    let response = client
        .post(node.url(&format!(
            "/api/localsend/v2/upload?sessionId={session_id}&fileId=f2&token={token2}"
        )))
        .body("second file".to_string())
        .send()
        .await
        .expect("upload");
    assert_ne!(response.status(), 200);

    // A started session gets exactly one upload_end on cancellation,
    // with the unfinished file counted as failed; no upload_cancelled
    // alongside it.
    let mut kinds = Vec::new();
    while let Ok(Some(text)) =
        tokio::time::timeout(Duration::from_millis(500), feed.recv()).await
    {
        let note: serde_json::Value = serde_json::from_str(&text).unwrap();
        if note["type"] == "upload_end" {
            assert_eq!(note["data"]["successFiles"], 1);
            assert_eq!(note["data"]["failedFiles"], 1);
        }
        kinds.push(note["type"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds.iter().filter(|k| *k == "upload_end").count(), 1);
    assert!(!kinds.iter().any(|k| k == "upload_cancelled"));
    assert_eq!(kinds.first().map(String::as_str), Some("upload_start"));
}

#[tokio::test]
async fn test_v1_flow_with_address_binding() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();
    let content_one = b"legacy one";
    let content_two = b"legacy two";

    // v1 send-request answers with the bare token map.
    let tokens: HashMap<String, String> = client
        .post(node.url("/api/localsend/v1/send-request"))
        .json(&prepare_body(&[
            ("f1", "one.txt", content_one),
            ("f2", "two.txt", content_two),
        ]))
        .send()
        .await
        .expect("send-request")
        .json()
        .await
        .expect("token map");
    assert_eq!(tokens.len(), 2);

    // v1 send carries no session id; the node maps it from our address.
    for (file_id, content) in [("f1", content_one.as_slice()), ("f2", content_two.as_slice())] {
        let response = client
            .post(node.url(&format!(
                "/api/localsend/v1/send?fileId={file_id}&token={}",
                tokens[file_id]
            )))
            .body(content.to_vec())
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), 200, "file {file_id}");
    }

    // Both files landed; the binding is consumed with the session.
    let uploads = dir.path().join("uploads");
    let session_dir = std::fs::read_dir(&uploads)
        .expect("uploads dir")
        .next()
        .expect("session dir")
        .expect("entry")
        .path();
    assert!(session_dir.join("one.txt").exists());
    assert!(session_dir.join("two.txt").exists());
}

#[tokio::test]
async fn test_text_message_shortcut_touches_no_disk() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();

    let answer = auto_answer(&node.context, true);
    let body = serde_json::json!({
        "info": {"alias": "Phone", "fingerprint": "bb".repeat(16), "deviceType": "mobile"},
        "files": {
            "m1": {
                "id": "m1",
                "fileName": "message.txt",
                "size": 5,
                "fileType": "text/plain",
                "preview": "hello",
            }
        }
    });
    let response = client
        .post(node.url("/api/localsend/v2/prepare-upload"))
        .json(&body)
        .send()
        .await
        .expect("prepare");
    assert_eq!(response.status(), 204);
    answer.await.unwrap();

    assert!(!dir.path().join("uploads").exists());
}

#[tokio::test]
async fn test_reverse_download_flow() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.download = true;
    let node = start_node(config, &dir).await;
    let client = reqwest::Client::new();

    let shared = dir.path().join("shared.bin");
    let content = b"published bytes";
    std::fs::write(&shared, content).unwrap();

    let (session_id, _url) = node
        .context
        .share
        .create_session(vec![shared.display().to_string()], None, false)
        .await
        .expect("share");

    // First poll: awaiting confirmation.
    let response = client
        .get(node.url(&format!(
            "/api/localsend/v2/prepare-download?sessionId={session_id}"
        )))
        .send()
        .await
        .expect("prepare-download");
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "waiting_confirmation");

    // Publisher confirms this client through the management API.
    let response = client
        .get(node.url(&format!(
            "/api/self/v1/confirm-download?sessionId={session_id}&clientKey=127.0.0.1&confirmed=true"
        )))
        .send()
        .await
        .expect("confirm");
    assert_eq!(response.status(), 200);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Re-poll: full listing.
    let listing: serde_json::Value = client
        .get(node.url(&format!(
            "/api/localsend/v2/prepare-download?sessionId={session_id}"
        )))
        .send()
        .await
        .expect("prepare-download")
        .json()
        .await
        .expect("listing");
    let file_id = listing["files"]
        .as_object()
        .unwrap()
        .keys()
        .next()
        .unwrap()
        .clone();

    // Fetch the bytes.
    let response = client
        .get(node.url(&format!(
            "/api/localsend/v2/download?sessionId={session_id}&fileId={file_id}"
        )))
        .send()
        .await
        .expect("download");
    assert_eq!(response.status(), 200);
    let disposition = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(disposition.contains("attachment"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), content);
}

#[tokio::test]
async fn test_info_and_register_handshake() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();

    let info: serde_json::Value = client
        .get(node.url("/api/localsend/v2/info"))
        .send()
        .await
        .expect("info")
        .json()
        .await
        .expect("descriptor");
    assert_eq!(info["fingerprint"].as_str().unwrap().len(), 32);

    let registered: serde_json::Value = client
        .post(node.url("/api/localsend/v2/register"))
        .json(&serde_json::json!({
            "alias": "Peer B",
            "fingerprint": "cc".repeat(16),
            "deviceType": "desktop",
            "port": 53317,
            "protocol": "http",
        }))
        .send()
        .await
        .expect("register")
        .json()
        .await
        .expect("descriptor");
    assert_eq!(registered["fingerprint"], info["fingerprint"]);

    // The peer is now in the management listing.
    let peers: serde_json::Value = client
        .get(node.url("/api/self/v1/scan-current"))
        .send()
        .await
        .expect("scan-current")
        .json()
        .await
        .expect("peers");
    let aliases: Vec<&str> = peers
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["alias"].as_str())
        .collect();
    assert!(aliases.contains(&"Peer B"));
}

#[tokio::test]
async fn test_config_patch_roundtrip() {
    let dir = TempDir::new().unwrap();
    let node = start_node(Config::default(), &dir).await;
    let client = reqwest::Client::new();

    let view: serde_json::Value = client
        .get(node.url("/api/self/v1/config"))
        .send()
        .await
        .expect("get config")
        .json()
        .await
        .expect("view");
    assert_eq!(view["pinSet"], false);

    let patched: serde_json::Value = client
        .patch(node.url("/api/self/v1/config"))
        .json(&serde_json::json!({"alias": "Renamed", "pin": "0000"}))
        .send()
        .await
        .expect("patch")
        .json()
        .await
        .expect("view");
    assert_eq!(patched["alias"], "Renamed");
    assert_eq!(patched["pinSet"], true);

    // Persisted to the YAML file.
    let persisted = Config::load(&dir.path().join("config.yaml")).expect("reload");
    assert_eq!(persisted.alias, "Renamed");
    assert_eq!(persisted.pin, "0000");
}
