//! WebSocket end-to-end tests: a real listener, a real client, and a fake
//! source-control tool behind the repository layer.
#![cfg(unix)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use isl_core::{
    GitHubAuthProbe, HostnameChecker, PollerConfig, RepositoryCache,
};
use isl_server::assets::StaticAssets;
use isl_server::server::{create_app, AppState};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

const SENSITIVE: &str = "aaaabbbbccccddddaaaabbbbccccdddd";

struct NoProbe;

#[async_trait::async_trait]
impl GitHubAuthProbe for NoProbe {
    async fn is_github_host(&self, _hostname: &str) -> bool {
        false
    }
}

/// Fake tool + repo dir + a running server bound to an ephemeral port.
struct Harness {
    _tmp: tempfile::TempDir,
    repo_root: PathBuf,
    addr: SocketAddr,
}

fn fake_tool(dir: &Path, repo_root: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("fake-sl");
    let body = format!(
        "#!/bin/sh\ncase \"$1\" in\n  root) if [ \"$2\" = \"--dotdir\" ]; then echo '{root}/.sl'; else echo '{root}'; fi ;;\n  config) exit 1 ;;\n  status) echo '[]' ;;\n  *) ;;\nesac\n",
        root = repo_root.display()
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .unwrap();
    script.display().to_string()
}

async fn start_harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let repo_root = tmp.path().join("repo");
    std::fs::create_dir_all(repo_root.join(".sl")).unwrap();
    let command = fake_tool(tmp.path(), &repo_root);

    let state = AppState {
        sensitive_token: SENSITIVE.into(),
        challenge_token: "11112222333344441111222233334444".into(),
        command: command.into(),
        log_file_location: "stdout".into(),
        foreground: true,
        port: 0,
        cache: RepositoryCache::new(
            HostnameChecker::new(Arc::new(NoProbe)),
            PollerConfig::default(),
        ),
        assets: Arc::new(StaticAssets::load(tmp.path().join("no-assets"))),
        open_connections: Arc::new(AtomicUsize::new(0)),
    };
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Harness {
        _tmp: tmp,
        repo_root,
        addr,
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(harness: &Harness, token: &str) -> WsStream {
    let url = format!(
        "ws://{}/ws?token={token}&cwd={}",
        harness.addr,
        harness.repo_root.display()
    );
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket upgrade failed");
    stream
}

async fn next_json(stream: &mut WsStream) -> serde_json::Value {
    loop {
        let message =
            tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .expect("timed out waiting for server message")
                .expect("socket closed")
                .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read messages until one matches `type`; connections also carry pushed
/// repoInfo and fetch notifications we do not care about here.
async fn next_of_type(
    stream: &mut WsStream,
    wanted: &str,
) -> serde_json::Value {
    for _ in 0..50 {
        let value = next_json(stream).await;
        if value["type"] == wanted {
            return value;
        }
    }
    panic!("no '{wanted}' message arrived");
}

#[tokio::test]
async fn bad_token_closes_with_4100() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, "WRONG").await;

    let message =
        tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("socket error");
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Library(4100));
            assert_eq!(frame.reason.as_str(), "Invalid token");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_echoes_and_repo_binds() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, SENSITIVE).await;

    stream
        .send(Message::text(
            r#"{"type": "heartbeat", "id": "hb-1"}"#,
        ))
        .await
        .unwrap();
    let echo = next_of_type(&mut stream, "heartbeat").await;
    assert_eq!(echo["id"], "hb-1");

    let info = next_of_type(&mut stream, "repoInfo").await;
    assert_eq!(info["info"]["type"], "success");
    assert_eq!(
        info["info"]["repoRoot"],
        harness.repo_root.display().to_string()
    );
}

#[tokio::test]
async fn queued_messages_replay_after_binding() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, SENSITIVE).await;

    // Sent while the repo is still resolving; must be answered later.
    stream
        .send(Message::text(r#"{"type": "requestRepoInfo"}"#))
        .await
        .unwrap();

    let first = next_of_type(&mut stream, "repoInfo").await;
    assert_eq!(first["info"]["type"], "success");
}

#[tokio::test]
async fn merge_conflicts_subscription_pushes_current_state() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, SENSITIVE).await;

    stream
        .send(Message::text(
            r#"{"type": "subscribe", "subscriptionID": "mc1", "kind": "mergeConflicts"}"#,
        ))
        .await
        .unwrap();
    let result = next_of_type(&mut stream, "subscriptionResult").await;
    assert_eq!(result["subscriptionID"], "mc1");
    assert_eq!(result["kind"], "mergeConflicts");
    assert_eq!(result["data"], serde_json::Value::Null);
}

#[tokio::test]
async fn binary_continuation_uploads_a_file() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, SENSITIVE).await;

    stream
        .send(Message::text(
            r#"{"type": "uploadFile", "id": "u1", "filename": "shot.png", "hasBinaryPayload": true}"#,
        ))
        .await
        .unwrap();
    stream
        .send(Message::binary(vec![1u8, 2, 3, 4]))
        .await
        .unwrap();

    let uploaded = next_of_type(&mut stream, "uploadedFile").await;
    assert_eq!(uploaded["id"], "u1");
    let path = uploaded["result"].as_str().expect("upload should succeed");
    assert!(path.ends_with("shot.png"));
    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes, vec![1u8, 2, 3, 4]);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn binary_frame_without_marker_is_dropped_not_fatal() {
    let harness = start_harness().await;
    let mut stream = connect(&harness, SENSITIVE).await;

    stream
        .send(Message::binary(vec![9u8, 9, 9]))
        .await
        .unwrap();
    // The connection survives the protocol error.
    stream
        .send(Message::text(
            r#"{"type": "heartbeat", "id": "still-alive"}"#,
        ))
        .await
        .unwrap();
    let echo = next_of_type(&mut stream, "heartbeat").await;
    assert_eq!(echo["id"], "still-alive");
}
