//! In-process HTTP tests against the axum app: challenge endpoint, static
//! assets, and WebSocket upgrade gating.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use isl_core::{
    GitHubAuthProbe, HostnameChecker, PollerConfig, RepositoryCache,
};
use isl_server::assets::StaticAssets;
use isl_server::server::{create_app, AppState};
use tower::util::ServiceExt;

const SENSITIVE: &str = "aaaabbbbccccddddaaaabbbbccccdddd";
const CHALLENGE: &str = "11112222333344441111222233334444";

struct NoProbe;

#[async_trait::async_trait]
impl GitHubAuthProbe for NoProbe {
    async fn is_github_host(&self, _hostname: &str) -> bool {
        false
    }
}

fn test_state(assets_dir: &std::path::Path) -> AppState {
    AppState {
        sensitive_token: SENSITIVE.into(),
        challenge_token: CHALLENGE.into(),
        command: "sl".into(),
        log_file_location: "stdout".into(),
        foreground: true,
        port: 0,
        cache: RepositoryCache::new(
            HostnameChecker::new(Arc::new(NoProbe)),
            PollerConfig::default(),
        ),
        assets: Arc::new(StaticAssets::load(assets_dir.to_path_buf())),
        open_connections: Arc::new(AtomicUsize::new(0)),
    }
}

fn assets_fixture() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("manifest.json"),
        r#"["index.html", "isl.css"]"#,
    )
    .unwrap();
    std::fs::write(tmp.path().join("index.html"), "<html>isl</html>")
        .unwrap();
    std::fs::write(tmp.path().join("isl.css"), "body {}").unwrap();
    tmp
}

#[tokio::test]
async fn challenge_succeeds_with_sensitive_token() {
    let assets = assets_fixture();
    let app = create_app(test_state(assets.path()));
    let response = app
        .oneshot(
            Request::get(format!(
                "/challenge_authenticity?token={SENSITIVE}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["challengeToken"], CHALLENGE);
    assert_eq!(body["pid"], std::process::id());
}

#[tokio::test]
async fn challenge_rejects_wrong_or_missing_token() {
    let assets = assets_fixture();
    let app = create_app(test_state(assets.path()));
    let response = app
        .clone()
        .oneshot(
            Request::get("/challenge_authenticity?token=WRONG")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/challenge_authenticity")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn index_is_served_from_the_manifest() {
    let assets = assets_fixture();
    let app = create_app(test_state(assets.path()));
    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
}

#[tokio::test]
async fn unlisted_paths_are_404() {
    let assets = assets_fixture();
    let app = create_app(test_state(assets.path()));
    for path in ["/favicon.ico", "/manifest.json", "/../etc/passwd"] {
        let response = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::NOT_FOUND,
            "expected 404 for {path}"
        );
    }
}

#[tokio::test]
async fn ws_route_requires_an_upgrade() {
    let assets = assets_fixture();
    let app = create_app(test_state(assets.path()));
    // A plain GET (no upgrade headers) must not be treated as an asset.
    let response = app
        .oneshot(
            Request::get(format!("/ws?token={SENSITIVE}&cwd=/tmp"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);
    assert_ne!(response.status(), StatusCode::NOT_FOUND);
}
