//! Per-WebSocket message router.
//!
//! Each connection walks a small state machine: `Loading` until a
//! repository resolves for its cwd, then `Bound` (or `Errored`). Messages
//! that need a repository are queued while loading and replayed in arrival
//! order once the state settles. Subscriptions are tracked per id so
//! disconnects and rebinds can dispose them deterministically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use isl_core::{
    generate_token, RepoError, RepoResolution, Repository,
    RepositoryContext, RepositoryReference, RunResult,
};
use isl_model::{
    ApplicationInfo, ClientMessage, FetchKind, OperationId,
    OperationProgress, PageId, Platform, PollKind, ServerMessage,
    SubscriptionData, SubscriptionId, SubscriptionKind, WireResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// A live client connection; construct with [`ClientConnection::new`] and
/// drive with [`ClientConnection::run`].
#[derive(Debug)]
pub struct ClientConnection {
    state: AppState,
    initial_cwd: String,
    platform: Platform,
}

enum ConnState {
    Loading,
    Bound(Arc<Repository>),
    Errored(RepoError),
}

enum RouterEvent {
    Resolved {
        epoch: u64,
        resolution: RepoResolution,
    },
}

impl ClientConnection {
    pub fn new(state: AppState, cwd: String, platform: Platform) -> Self {
        Self {
            state,
            initial_cwd: cwd,
            platform,
        }
    }

    pub async fn run(self, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, out_rx));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut router = ConnectionRouter {
            state: self.state,
            out: out_tx,
            events: events_tx,
            platform: self.platform,
            page_id: PageId(format!("page-{}", &generate_token()[..8])),
            cwd: PathBuf::from(&self.initial_cwd),
            epoch: 0,
            conn: ConnState::Loading,
            queued: Vec::new(),
            subscriptions: HashMap::new(),
            repo_tasks: Vec::new(),
            repo_ref: None,
            pending_binary: None,
        };
        info!(cwd = %router.cwd.display(), page = %router.page_id, "client connected");
        router.change_cwd(self.initial_cwd);

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        router.on_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        router.on_binary(bytes.to_vec());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the stack
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                },
                event = events_rx.recv() => match event {
                    Some(RouterEvent::Resolved { epoch, resolution }) => {
                        router.on_resolved(epoch, resolution);
                    }
                    None => break,
                },
            }
        }

        router.shutdown();
        writer.abort();
        info!("client disconnected");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "unserializable server message");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

struct ConnectionRouter {
    state: AppState,
    out: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedSender<RouterEvent>,
    platform: Platform,
    page_id: PageId,
    cwd: PathBuf,
    /// Guards against late resolutions after a `changeCwd`.
    epoch: u64,
    conn: ConnState,
    queued: Vec<ClientMessage>,
    subscriptions: HashMap<SubscriptionId, JoinHandle<()>>,
    /// Connection-scoped forwarders (begin-fetching events) disposed on
    /// rebind and disconnect.
    repo_tasks: Vec<JoinHandle<()>>,
    repo_ref: Option<RepositoryReference>,
    /// One-slot buffer for a JSON message awaiting its binary frame.
    pending_binary: Option<ClientMessage>,
}

impl ConnectionRouter {
    fn send(&self, message: ServerMessage) {
        let _ = self.out.send(message);
    }

    // --------------------------------------------------------------
    // Repo binding

    fn change_cwd(&mut self, cwd: String) {
        self.epoch += 1;
        self.cwd = PathBuf::from(&cwd);
        self.detach_repo();
        self.conn = ConnState::Loading;

        let reference = self.state.cache.get_or_create(RepositoryContext::new(
            self.state.command.to_string(),
            &self.cwd,
        ));
        let resolution = reference.wait();
        self.repo_ref = Some(reference);

        let events = self.events.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let resolution = resolution.await;
            let _ = events.send(RouterEvent::Resolved { epoch, resolution });
        });
    }

    fn on_resolved(&mut self, epoch: u64, resolution: RepoResolution) {
        if epoch != self.epoch {
            debug!("ignoring stale repository resolution");
            return;
        }
        match resolution {
            Ok(repo) => {
                self.send(ServerMessage::RepoInfo {
                    info: repo.info().clone(),
                });
                self.attach_repo(&repo);
                self.conn = ConnState::Bound(repo);
            }
            Err(error) => {
                self.send(ServerMessage::RepoInfo {
                    info: error.as_repo_info(&self.cwd),
                });
                self.conn = ConnState::Errored(error);
            }
        }
        for message in std::mem::take(&mut self.queued) {
            self.dispatch(message);
        }
    }

    fn attach_repo(&mut self, repo: &Arc<Repository>) {
        let mut began = repo.subscribe_began_fetching();
        let out = self.out.clone();
        self.repo_tasks.push(tokio::spawn(async move {
            while let Some(kind) = began.recv().await {
                if out.send(ServerMessage::BeganFetching { kind }).is_err() {
                    break;
                }
            }
        }));
    }

    fn detach_repo(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        for task in self.repo_tasks.drain(..) {
            task.abort();
        }
        if let ConnState::Bound(repo) = &self.conn {
            repo.poller().page_disconnected(&self.page_id);
        }
        if let Some(reference) = self.repo_ref.take() {
            reference.unref();
        }
    }

    fn shutdown(&mut self) {
        self.detach_repo();
        self.conn = ConnState::Loading;
    }

    // --------------------------------------------------------------
    // Inbound frames

    fn on_text(&mut self, text: &str) {
        if self.pending_binary.take().is_some() {
            warn!("json frame arrived while a binary payload was pending; dropping the pending marker");
        }
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed client message dropped");
                return;
            }
        };
        if message.expects_binary_payload() {
            self.pending_binary = Some(message);
            return;
        }
        self.dispatch(message);
    }

    fn on_binary(&mut self, bytes: Vec<u8>) {
        match self.pending_binary.take() {
            Some(ClientMessage::UploadFile { id, filename, .. }) => {
                self.handle_upload(id, filename, bytes);
            }
            Some(other) => {
                warn!(?other, "unexpected binary continuation dropped");
            }
            None => {
                warn!("binary frame without a continuation marker dropped");
            }
        }
    }

    /// Route a message according to connection state. Repo-independent
    /// messages answer immediately; the rest queue while loading.
    fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Heartbeat { id } => {
                self.send(ServerMessage::Heartbeat { id });
            }
            ClientMessage::RequestApplicationInfo => {
                self.send(ServerMessage::ApplicationInfo {
                    info: ApplicationInfo {
                        platform_name: self.platform.name().to_owned(),
                        version: env!("CARGO_PKG_VERSION").to_owned(),
                        log_file_path: self.state.log_file_location.to_string(),
                    },
                });
            }
            ClientMessage::ChangeCwd { cwd } => self.change_cwd(cwd),
            other => match &self.conn {
                ConnState::Loading => self.queued.push(other),
                ConnState::Errored(error) => self.dispatch_errored(other, error.clone()),
                ConnState::Bound(repo) => {
                    let repo = Arc::clone(repo);
                    self.dispatch_bound(repo, other);
                }
            },
        }
    }

    fn dispatch_errored(&self, message: ClientMessage, error: RepoError) {
        match message {
            ClientMessage::RequestRepoInfo => {
                self.send(ServerMessage::RepoInfo {
                    info: error.as_repo_info(&self.cwd),
                });
            }
            other => {
                debug!(?other, "dropping message; no repository is bound");
            }
        }
    }

    fn dispatch_bound(&mut self, repo: Arc<Repository>, message: ClientMessage) {
        match message {
            ClientMessage::RequestRepoInfo => {
                self.send(ServerMessage::RepoInfo {
                    info: repo.info().clone(),
                });
            }
            ClientMessage::PageVisibility { page, state } => {
                self.page_id = page.clone();
                repo.poller().set_page_visibility(page, state);
            }
            ClientMessage::Subscribe {
                subscription_id,
                kind,
            } => self.subscribe(repo, subscription_id, kind),
            ClientMessage::Unsubscribe { subscription_id } => {
                if let Some(task) = self.subscriptions.remove(&subscription_id)
                {
                    task.abort();
                }
            }
            ClientMessage::RunOperation { operation } => {
                self.run_operation(repo, operation);
            }
            ClientMessage::AbortRunningOperation { operation_id } => {
                repo.abort_running_operation(&operation_id);
            }
            ClientMessage::Refresh => repo.poll(PollKind::Force),
            ClientMessage::LoadMoreCommits => repo.load_more_commits(),
            ClientMessage::GetConfig { id, name } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let value =
                        repo.get_config(&name).await.unwrap_or_default();
                    let _ = out.send(ServerMessage::GotConfig {
                        id,
                        name,
                        value,
                    });
                });
            }
            ClientMessage::SetConfig { name, value } => {
                tokio::spawn(async move {
                    if let Err(e) = repo.set_config(&name, &value).await {
                        warn!(name, error = %e, "setConfig failed");
                    }
                });
            }
            ClientMessage::RequestComparison { comparison } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let diff = repo.comparison_diff(&comparison).await;
                    let _ = out.send(ServerMessage::Comparison {
                        comparison,
                        diff: WireResult::from_result(diff),
                    });
                });
            }
            ClientMessage::RequestComparisonContextLines {
                id,
                path,
                start,
                num_lines,
            } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let lines = repo
                        .comparison_context_lines(&path, start, num_lines)
                        .await;
                    let _ = out.send(ServerMessage::ComparisonContextLines {
                        id,
                        lines: WireResult::from_result(lines),
                    });
                });
            }
            ClientMessage::FetchShelvedChanges { id } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let shelves = repo.fetch_shelved_changes().await;
                    let _ = out.send(ServerMessage::FetchedShelvedChanges {
                        id,
                        shelves: WireResult::from_result(shelves),
                    });
                });
            }
            ClientMessage::FetchLatestCommit { id, revset } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let info = repo.fetch_latest_commit(&revset).await;
                    let _ = out.send(ServerMessage::FetchedLatestCommit {
                        id,
                        revset,
                        info: WireResult::from_result(info),
                    });
                });
            }
            ClientMessage::FetchAllCommitChangedFiles { id, hash } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let files =
                        repo.fetch_all_commit_changed_files(&hash).await;
                    let _ =
                        out.send(ServerMessage::FetchedAllCommitChangedFiles {
                            id,
                            hash,
                            files: WireResult::from_result(files),
                        });
                });
            }
            ClientMessage::FetchCommitCloudState { id } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let state = repo.fetch_commit_cloud_state().await;
                    let _ = out.send(ServerMessage::FetchedCommitCloudState {
                        id,
                        state: WireResult::from_result(state),
                    });
                });
            }
            ClientMessage::FetchGeneratedStatuses { id, paths } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let results =
                        repo.fetch_generated_statuses(&paths).await;
                    let _ = out.send(ServerMessage::FetchedGeneratedStatuses {
                        id,
                        results,
                    });
                });
            }
            ClientMessage::FetchDiffSummaries => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let summaries = repo.fetch_diff_summaries().await;
                    let _ = out.send(ServerMessage::FetchedDiffSummaries {
                        summaries: WireResult::from_result(summaries),
                    });
                });
            }
            ClientMessage::ExportStack { id, revs } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let stack = repo.export_stack(&revs).await;
                    let _ = out.send(ServerMessage::ExportedStack {
                        id,
                        revs,
                        stack: WireResult::from_result(stack),
                    });
                });
            }
            ClientMessage::ImportStack { id, stack } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let imported = repo.import_stack(&stack).await;
                    let _ = out.send(ServerMessage::ImportedStack {
                        id,
                        imported: WireResult::from_result(imported),
                    });
                });
            }
            ClientMessage::UploadFile { id, .. } => {
                // Reachable only when hasBinaryPayload was false.
                self.send(ServerMessage::UploadedFile {
                    id,
                    result: WireResult::Err {
                        error: "missing binary payload".to_owned(),
                    },
                });
            }
            ClientMessage::Heartbeat { .. }
            | ClientMessage::ChangeCwd { .. }
            | ClientMessage::RequestApplicationInfo
            | ClientMessage::PageVisibility { .. } => unreachable!(),
        }
    }

    fn subscribe(
        &mut self,
        repo: Arc<Repository>,
        subscription_id: SubscriptionId,
        kind: SubscriptionKind,
    ) {
        // At most one active subscription per id.
        if let Some(old) = self.subscriptions.remove(&subscription_id) {
            old.abort();
        }
        let out = self.out.clone();
        let sid = subscription_id.clone();
        let task = match kind {
            SubscriptionKind::UncommittedChanges => {
                let mut rx = repo.subscribe_uncommitted_changes();
                tokio::spawn(async move {
                    while let Some(result) = rx.recv().await {
                        let message = ServerMessage::SubscriptionResult {
                            subscription_id: sid.clone(),
                            data: SubscriptionData::UncommittedChanges {
                                data: WireResult::from_result(
                                    result.map_err(DisplayError),
                                ),
                            },
                        };
                        if out.send(message).is_err() {
                            break;
                        }
                    }
                })
            }
            SubscriptionKind::SmartlogCommits => {
                let mut rx = repo.subscribe_smartlog_commits();
                tokio::spawn(async move {
                    while let Some(result) = rx.recv().await {
                        let message = ServerMessage::SubscriptionResult {
                            subscription_id: sid.clone(),
                            data: SubscriptionData::SmartlogCommits {
                                data: WireResult::from_result(
                                    result.map_err(DisplayError),
                                ),
                            },
                        };
                        if out.send(message).is_err() {
                            break;
                        }
                    }
                })
            }
            SubscriptionKind::MergeConflicts => {
                let mut rx = repo.subscribe_merge_conflicts();
                tokio::spawn(async move {
                    while let Some(state) = rx.recv().await {
                        let message = ServerMessage::SubscriptionResult {
                            subscription_id: sid.clone(),
                            data: SubscriptionData::MergeConflicts {
                                data: state,
                            },
                        };
                        if out.send(message).is_err() {
                            break;
                        }
                    }
                })
            }
        };
        self.subscriptions.insert(subscription_id, task);
        repo.request_fetch(fetch_kind_for(kind));
    }

    fn run_operation(
        &self,
        repo: Arc<Repository>,
        operation: isl_model::RunnableOperation,
    ) {
        let (progress_tx, mut progress_rx) =
            mpsc::unbounded_channel::<(OperationId, OperationProgress)>();
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some((id, progress)) = progress_rx.recv().await {
                if out
                    .send(ServerMessage::OperationProgress { id, progress })
                    .is_err()
                {
                    break;
                }
            }
        });

        let out = self.out.clone();
        let cwd = self.cwd.clone();
        let operation_id = operation.id.clone();
        tokio::spawn(async move {
            match repo.run_operation(cwd, operation, progress_tx).await {
                Ok(RunResult::Ran) => {}
                Ok(RunResult::Skipped) => {
                    let _ = out.send(ServerMessage::OperationProgress {
                        id: operation_id,
                        progress: OperationProgress::Skipped,
                    });
                }
                Err(e) => {
                    let _ = out.send(ServerMessage::OperationProgress {
                        id: operation_id,
                        progress: OperationProgress::Error {
                            error: e.to_string(),
                        },
                    });
                }
            }
        });
    }

    fn handle_upload(&self, id: String, filename: String, bytes: Vec<u8>) {
        let out = self.out.clone();
        tokio::spawn(async move {
            let result = save_upload(&filename, &bytes).await;
            let _ = out.send(ServerMessage::UploadedFile {
                id,
                result: WireResult::from_result(result),
            });
        });
    }
}

/// Adapter so plain-`String` fetch errors satisfy `WireResult::from_result`.
struct DisplayError(String);

impl std::fmt::Display for DisplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fetch_kind_for(kind: SubscriptionKind) -> FetchKind {
    match kind {
        SubscriptionKind::UncommittedChanges => FetchKind::UncommittedChanges,
        SubscriptionKind::SmartlogCommits => FetchKind::Commits,
        SubscriptionKind::MergeConflicts => FetchKind::MergeConflicts,
    }
}

async fn save_upload(
    filename: &str,
    bytes: &[u8],
) -> Result<String, std::io::Error> {
    let dir = std::env::temp_dir().join("isl-uploads");
    tokio::fs::create_dir_all(&dir).await?;
    // Keep only the final component so uploads cannot escape the dir.
    let base = std::path::Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned());
    let path = dir.join(format!("{}-{}", &generate_token()[..8], base));
    tokio::fs::write(&path, bytes).await?;
    Ok(path.display().to_string())
}
