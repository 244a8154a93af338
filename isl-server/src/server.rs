//! The HTTP + WebSocket server: static assets, the challenge endpoint, the
//! authenticated WebSocket upgrade, and idle self-shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use isl_core::serverdir::tokens_equal;
use isl_core::{
    GhCliProbe, HostnameChecker, PollerConfig, RepositoryCache, ServerDir,
};
use isl_model::{ChallengeResponse, Platform};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assets::StaticAssets;
use crate::child::StartServerArgs;
use crate::connection::ClientConnection;

/// WebSocket close code telling the client not to reconnect.
pub const CLOSE_DO_NOT_RECONNECT: u16 = 4100;

/// How long a backgrounded server lingers after its last WebSocket closes
/// before checking whether it should exit.
const IDLE_SHUTDOWN_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub sensitive_token: Arc<str>,
    pub challenge_token: Arc<str>,
    pub command: Arc<str>,
    pub log_file_location: Arc<str>,
    pub foreground: bool,
    pub port: u16,
    pub cache: RepositoryCache,
    pub assets: Arc<StaticAssets>,
    pub open_connections: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("port", &self.port)
            .field("foreground", &self.foreground)
            .finish()
    }
}

/// Outcome of a listen attempt, with the expected error mapping.
pub enum StartServerResult {
    Started {
        port: u16,
        state: AppState,
        serve: tokio::task::JoinHandle<()>,
    },
    AddressInUse,
    NeedsElevatedPrivileges,
    Error(String),
}

impl std::fmt::Debug for StartServerResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartServerResult::Started { port, .. } => {
                write!(f, "Started({port})")
            }
            StartServerResult::AddressInUse => write!(f, "AddressInUse"),
            StartServerResult::NeedsElevatedPrivileges => {
                write!(f, "NeedsElevatedPrivileges")
            }
            StartServerResult::Error(e) => write!(f, "Error({e})"),
        }
    }
}

/// Bind the port and start serving. Returns as soon as the listener is
/// live; the serve task runs until the process exits.
pub async fn start_server(args: &StartServerArgs) -> StartServerResult {
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            return match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    StartServerResult::AddressInUse
                }
                std::io::ErrorKind::PermissionDenied => {
                    StartServerResult::NeedsElevatedPrivileges
                }
                _ => StartServerResult::Error(e.to_string()),
            };
        }
    };

    let cache = RepositoryCache::new(
        HostnameChecker::new(Arc::new(GhCliProbe)),
        PollerConfig::default(),
    );
    let state = AppState {
        sensitive_token: args.sensitive_token.clone().into(),
        challenge_token: args.challenge_token.clone().into(),
        command: args.command.clone().into(),
        log_file_location: args.log_file_location.clone().into(),
        foreground: args.foreground,
        port: args.port,
        cache,
        assets: Arc::new(StaticAssets::load(StaticAssets::default_root())),
        open_connections: Arc::new(AtomicUsize::new(0)),
    };

    spawn_signal_handler(state.clone());
    // A background server nobody ever connects to should also go away.
    schedule_idle_shutdown(state.clone());

    let app = create_app(state.clone());
    info!(port = args.port, "listening");
    let serve = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "server stopped unexpectedly");
        }
    });

    StartServerResult::Started {
        port: args.port,
        state,
        serve,
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/challenge_authenticity", get(challenge_handler))
        .route("/ws", get(ws_handler))
        .fallback(get(asset_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct ChallengeParams {
    #[serde(default)]
    token: String,
}

/// Prove this server owns the port: a caller presenting the sensitive token
/// gets the challenge token and our pid back.
async fn challenge_handler(
    State(state): State<AppState>,
    Query(params): Query<ChallengeParams>,
) -> Response {
    if !tokens_equal(&params.token, &state.sensitive_token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(ChallengeResponse {
        challenge_token: state.challenge_token.to_string(),
        pid: std::process::id(),
    })
    .into_response()
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(default)]
    token: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    platform: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let authenticated = tokens_equal(&params.token, &state.sensitive_token);
    let platform = params
        .platform
        .as_deref()
        .and_then(Platform::parse)
        .unwrap_or_default();
    let cwd = params.cwd.clone();

    ws.on_upgrade(move |mut socket| async move {
        if !authenticated {
            warn!("rejecting websocket with bad token");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_DO_NOT_RECONNECT,
                    reason: "Invalid token".into(),
                })))
                .await;
            return;
        }

        state.open_connections.fetch_add(1, Ordering::SeqCst);
        ClientConnection::new(state.clone(), cwd, platform)
            .run(socket)
            .await;
        state.open_connections.fetch_sub(1, Ordering::SeqCst);
        schedule_idle_shutdown(state.clone());
    })
}

async fn asset_handler(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    state.assets.serve(path).await
}

/// After a WebSocket closes, a backgrounded server waits a minute and exits
/// if nothing is left alive. Rapidly re-opened tabs land inside the window
/// and keep the process warm.
fn schedule_idle_shutdown(state: AppState) {
    if state.foreground {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(IDLE_SHUTDOWN_DELAY).await;
        let connections = state.open_connections.load(Ordering::SeqCst);
        let repos = state.cache.active_repo_count();
        if connections == 0 && repos == 0 {
            info!("idle, shutting down");
            clean_exit(&state, 0).await;
        }
    });
}

/// Dispose repositories, remove the port's server record, and exit the
/// process.
pub async fn clean_exit(state: &AppState, code: i32) {
    state.cache.dispose_all();
    if let Ok(dir) = ServerDir::user_default() {
        let _ = dir.delete(state.port).await;
    }
    std::process::exit(code);
}

fn spawn_signal_handler(state: AppState) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "no SIGTERM handler");
                    return;
                }
            };
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = term.recv() => {}
                _ = ctrl_c => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("terminating on signal");
        clean_exit(&state, 0).await;
    });
}

