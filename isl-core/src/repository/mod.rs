//! One `Repository` per discovered repo root: owns the operation queue, the
//! poller, per-kind fetch state, and the subscription emitters that push
//! updates to connected routers.

pub mod conflicts;
pub mod discovery;
mod reads;
pub mod smartlog;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use isl_model::{
    ChangedFile, CodeReviewSystem, FetchKind, FileStatus, MergeConflicts,
    PollKind, PreferredSubmitCommand, RepoInfo, RunnableOperation,
    SmartlogCommits, UncommittedChanges,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codereview::CodeReviewProvider;
use crate::error::{IslError, Result};
use crate::exec::{self, CommandOutput, ExecOptions};
use crate::queue::{OperationQueue, ProgressSender, RunResult};
use crate::watch::{PollerConfig, WatchForChanges};

pub use discovery::{
    get_repo_info, Discovery, RepoSettings, RepositoryContext,
};

/// Upper bound for read commands so a wedged tool cannot pin a fetch lock.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrency cap shared by large parallelizable reads (`cat`,
/// generated-status scans).
const READ_CONCURRENCY: usize = 4;

/// Fetch results are broadcast to many subscribers, so the error side is a
/// plain string rather than a shared error object.
pub type FetchResult<T> = std::result::Result<T, String>;

/// The success fields of discovery, owned by the repository.
#[derive(Debug, Clone)]
pub struct RepoDetails {
    pub command: String,
    pub repo_root: PathBuf,
    pub dotdir: PathBuf,
    pub code_review_system: CodeReviewSystem,
    pub pull_request_domain: Option<String>,
    pub preferred_submit_command: Option<PreferredSubmitCommand>,
}

type Subscribers<T> = Mutex<Vec<mpsc::UnboundedSender<T>>>;

pub struct Repository {
    details: RepoDetails,
    info: RepoInfo,
    settings: RepoSettings,
    queue: OperationQueue,
    poller: Arc<WatchForChanges>,
    read_limiter: Arc<Semaphore>,
    code_review_provider: Option<Arc<dyn CodeReviewProvider>>,

    // Each fetch kind is serialized against itself.
    commits_fetch: tokio::sync::Mutex<()>,
    status_fetch: tokio::sync::Mutex<()>,
    conflicts_fetch: tokio::sync::Mutex<()>,

    latest_commits: Mutex<Option<FetchResult<SmartlogCommits>>>,
    latest_uncommitted: Mutex<Option<FetchResult<UncommittedChanges>>>,
    conflicts_state: Mutex<Option<MergeConflicts>>,

    commits_subs: Subscribers<FetchResult<SmartlogCommits>>,
    uncommitted_subs: Subscribers<FetchResult<UncommittedChanges>>,
    conflicts_subs: Subscribers<Option<MergeConflicts>>,
    began_subs: Subscribers<FetchKind>,

    /// Cursor into [`smartlog::VISIBLE_COMMIT_RANGES`].
    range_index: AtomicUsize,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("repo_root", &self.details.repo_root)
            .field("command", &self.details.command)
            .finish()
    }
}

impl Repository {
    /// Build a repository from a successful discovery and start its
    /// background refresh listener.
    pub fn new(
        discovery: Discovery,
        poller_config: PollerConfig,
    ) -> Result<Arc<Self>> {
        let RepoInfo::Success {
            command,
            repo_root,
            dotdir,
            code_review_system,
            pull_request_domain,
            preferred_submit_command,
        } = discovery.info.clone()
        else {
            return Err(IslError::Internal(
                "cannot construct a Repository from a failed discovery"
                    .to_owned(),
            ));
        };
        let details = RepoDetails {
            command: command.clone(),
            repo_root: repo_root.clone(),
            dotdir,
            code_review_system,
            pull_request_domain,
            preferred_submit_command,
        };

        let repo = Arc::new(Self {
            info: discovery.info,
            settings: discovery.settings,
            queue: OperationQueue::new(command, repo_root.clone()),
            poller: WatchForChanges::new(poller_config),
            read_limiter: Arc::new(Semaphore::new(READ_CONCURRENCY)),
            code_review_provider: None,
            commits_fetch: tokio::sync::Mutex::new(()),
            status_fetch: tokio::sync::Mutex::new(()),
            conflicts_fetch: tokio::sync::Mutex::new(()),
            latest_commits: Mutex::new(None),
            latest_uncommitted: Mutex::new(None),
            conflicts_state: Mutex::new(None),
            commits_subs: Mutex::new(Vec::new()),
            uncommitted_subs: Mutex::new(Vec::new()),
            conflicts_subs: Mutex::new(Vec::new()),
            began_subs: Mutex::new(Vec::new()),
            range_index: AtomicUsize::new(0),
            listener: Mutex::new(None),
            details,
        });

        let listener = tokio::spawn(Self::refresh_loop(Arc::downgrade(&repo)));
        *repo.listener.lock() = Some(listener);
        info!(repo_root = %repo_root.display(), "repository created");
        Ok(repo)
    }

    /// Background refresh driver: consumes the poller's change stream and
    /// dispatches fetches, honoring the hold-off window for non-forced
    /// polls.
    async fn refresh_loop(repo: std::sync::Weak<Repository>) {
        let mut rx = match repo.upgrade() {
            Some(repo) => repo.poller.subscribe(),
            None => return,
        };
        while let Some((kind, poll)) = rx.recv().await {
            let Some(repo) = repo.upgrade() else { return };
            if poll != PollKind::Force
                && repo
                    .queue
                    .within_hold_off(repo.settings.hold_off_refresh)
            {
                debug!(?kind, "skipping refresh during hold-off");
                continue;
            }
            match kind {
                FetchKind::UncommittedChanges => {
                    repo.fetch_uncommitted_changes().await;
                }
                FetchKind::Commits => repo.fetch_smartlog_commits().await,
                FetchKind::MergeConflicts => repo.check_conflicts().await,
                FetchKind::Everything => {
                    repo.fetch_uncommitted_changes().await;
                    repo.fetch_smartlog_commits().await;
                    repo.check_conflicts().await;
                }
            }
        }
    }

    pub fn info(&self) -> &RepoInfo {
        &self.info
    }

    pub fn details(&self) -> &RepoDetails {
        &self.details
    }

    pub fn repo_root(&self) -> &PathBuf {
        &self.details.repo_root
    }

    pub fn poller(&self) -> &Arc<WatchForChanges> {
        &self.poller
    }

    pub fn code_review_provider(
        &self,
    ) -> Option<&Arc<dyn CodeReviewProvider>> {
        self.code_review_provider.as_ref()
    }

    /// Run the tool inside this repository with the read timeout.
    pub(crate) async fn run_tool(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> =
            args.iter().map(|s| (*s).to_owned()).collect();
        exec::run_command(
            &self.details.command,
            &args,
            ExecOptions::new(&self.details.repo_root).timeout(READ_TIMEOUT),
        )
        .await
    }

    pub(crate) async fn run_tool_with_stdin(
        &self,
        args: &[&str],
        stdin: Vec<u8>,
    ) -> Result<CommandOutput> {
        let args: Vec<String> =
            args.iter().map(|s| (*s).to_owned()).collect();
        exec::run_command(
            &self.details.command,
            &args,
            ExecOptions::new(&self.details.repo_root)
                .timeout(READ_TIMEOUT)
                .stdin(stdin),
        )
        .await
    }

    pub(crate) fn read_limiter(&self) -> &Arc<Semaphore> {
        &self.read_limiter
    }

    // ------------------------------------------------------------------
    // Subscriptions

    pub fn subscribe_smartlog_commits(
        &self,
    ) -> mpsc::UnboundedReceiver<FetchResult<SmartlogCommits>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(latest) = self.latest_commits.lock().clone() {
            let _ = tx.send(latest);
        }
        self.commits_subs.lock().push(tx);
        rx
    }

    pub fn subscribe_uncommitted_changes(
        &self,
    ) -> mpsc::UnboundedReceiver<FetchResult<UncommittedChanges>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(latest) = self.latest_uncommitted.lock().clone() {
            let _ = tx.send(latest);
        }
        self.uncommitted_subs.lock().push(tx);
        rx
    }

    pub fn subscribe_merge_conflicts(
        &self,
    ) -> mpsc::UnboundedReceiver<Option<MergeConflicts>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.conflicts_state.lock().clone());
        self.conflicts_subs.lock().push(tx);
        rx
    }

    /// Begin-fetching notifications, one per fetch kind.
    pub fn subscribe_began_fetching(
        &self,
    ) -> mpsc::UnboundedReceiver<FetchKind> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.began_subs.lock().push(tx);
        rx
    }

    fn emit_began(&self, kind: FetchKind) {
        self.began_subs.lock().retain(|tx| tx.send(kind).is_ok());
    }

    fn store_and_emit_commits(&self, result: FetchResult<SmartlogCommits>) {
        *self.latest_commits.lock() = Some(result.clone());
        self.commits_subs
            .lock()
            .retain(|tx| tx.send(result.clone()).is_ok());
    }

    fn store_and_emit_uncommitted(
        &self,
        result: FetchResult<UncommittedChanges>,
    ) {
        *self.latest_uncommitted.lock() = Some(result.clone());
        self.uncommitted_subs
            .lock()
            .retain(|tx| tx.send(result.clone()).is_ok());
    }

    fn store_and_emit_conflicts(&self, state: Option<MergeConflicts>) {
        *self.conflicts_state.lock() = state.clone();
        self.conflicts_subs
            .lock()
            .retain(|tx| tx.send(state.clone()).is_ok());
    }

    /// Spawn a fetch of `kind` without waiting for it.
    pub fn request_fetch(self: &Arc<Self>, kind: FetchKind) {
        let repo = Arc::clone(self);
        tokio::spawn(async move {
            match kind {
                FetchKind::UncommittedChanges => {
                    repo.fetch_uncommitted_changes().await;
                }
                FetchKind::Commits => repo.fetch_smartlog_commits().await,
                FetchKind::MergeConflicts => repo.check_conflicts().await,
                FetchKind::Everything => {
                    repo.fetch_uncommitted_changes().await;
                    repo.fetch_smartlog_commits().await;
                    repo.check_conflicts().await;
                }
            }
        });
    }

    /// Ask the poller for a refresh; `Force` bypasses hold-off.
    pub fn poll(&self, kind: PollKind) {
        self.poller.poll(kind);
    }

    // ------------------------------------------------------------------
    // Fetches

    /// Fetch the working copy status. Transient failures (an in-progress
    /// checkout) are neither stored nor emitted; the next poll retries.
    pub async fn fetch_uncommitted_changes(&self) {
        let _serial = self.status_fetch.lock().await;
        self.emit_began(FetchKind::UncommittedChanges);
        let started = Utc::now();
        match self.run_status().await {
            Ok(files) => {
                self.store_and_emit_uncommitted(Ok(UncommittedChanges {
                    files,
                    fetch_started_at: started,
                    fetch_completed_at: Utc::now(),
                }));
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "dropping transient status failure");
            }
            Err(e) => {
                self.store_and_emit_uncommitted(Err(e.to_string()));
            }
        }
    }

    async fn run_status(&self) -> Result<Vec<ChangedFile>> {
        let out = self.run_tool(&["status", "-Tjson"]).await?;
        if !out.success() {
            if is_transient_stderr(&out.stderr) {
                return Err(IslError::TransientFetch(
                    out.stderr.trim().to_owned(),
                ));
            }
            return Err(IslError::CommandFailed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            });
        }
        parse_status_output(&out.stdout)
    }

    /// Fetch the smartlog at the current visible range.
    pub async fn fetch_smartlog_commits(&self) {
        let _serial = self.commits_fetch.lock().await;
        self.emit_began(FetchKind::Commits);
        let started = Utc::now();
        let days = smartlog::VISIBLE_COMMIT_RANGES
            [self.range_index.load(Ordering::SeqCst)];
        let result: Result<Vec<_>> = async {
            let template = smartlog::commit_template();
            let revset = smartlog::smartlog_revset(days);
            let out = self
                .run_tool(&["log", "--template", &template, "--rev", &revset])
                .await?
                .into_result()?;
            smartlog::parse_smartlog_output(&out.stdout)
        }
        .await;
        match result {
            Ok(commits) => {
                self.store_and_emit_commits(Ok(SmartlogCommits {
                    commits,
                    fetch_started_at: started,
                    fetch_completed_at: Utc::now(),
                }));
            }
            Err(e) => self.store_and_emit_commits(Err(e.to_string())),
        }
    }

    /// Widen the visible commit range one step and refetch.
    pub fn load_more_commits(self: &Arc<Self>) {
        let idx = self.range_index.load(Ordering::SeqCst);
        if idx + 1 < smartlog::VISIBLE_COMMIT_RANGES.len() {
            self.range_index.store(idx + 1, Ordering::SeqCst);
        }
        self.request_fetch(FetchKind::Commits);
    }

    /// Re-check merge conflicts, preserving resolved entries across checks.
    pub async fn check_conflicts(&self) {
        let _serial = self.conflicts_fetch.lock().await;

        let previously_active = self.conflicts_state.lock().is_some();
        if !previously_active {
            // Fast path: no merge dir, nothing to do.
            let merge_dir = self.details.dotdir.join("merge");
            match tokio::fs::try_exists(&merge_dir).await {
                Ok(true) => {}
                _ => return,
            }
            self.store_and_emit_conflicts(Some(MergeConflicts::Loading));
        }
        self.emit_began(FetchKind::MergeConflicts);
        let started = Utc::now();

        let out = self
            .run_tool(&["resolve", "--tool", "internal:dumpjson", "--all"])
            .await;
        let dump = match out {
            Ok(out) if out.success() => {
                conflicts::parse_resolve_output(&out.stdout)
            }
            Ok(out) => {
                debug!(stderr = %out.stderr.trim(), "resolve failed");
                self.store_and_emit_conflicts(None);
                return;
            }
            Err(e) => {
                warn!(error = %e, "resolve invocation failed");
                self.store_and_emit_conflicts(None);
                return;
            }
        };
        let Ok(Some(dump)) = dump else {
            self.store_and_emit_conflicts(None);
            return;
        };
        let (Some(command), Some(cmd_details)) =
            (dump.command, dump.command_details)
        else {
            // The merge ended between checks.
            self.store_and_emit_conflicts(None);
            return;
        };

        let current: Vec<String> =
            dump.conflicts.into_iter().map(|c| c.path).collect();
        let previous = {
            let state = self.conflicts_state.lock();
            state
                .as_ref()
                .map(|s| s.files().to_vec())
                .unwrap_or_default()
        };
        let files = conflicts::advance_files(&previous, &current);
        self.store_and_emit_conflicts(Some(MergeConflicts::Loaded {
            command,
            to_continue: cmd_details.to_continue,
            to_abort: cmd_details.to_abort,
            files,
            fetch_started_at: started,
            fetch_completed_at: Utc::now(),
        }));
    }

    pub fn merge_conflicts(&self) -> Option<MergeConflicts> {
        self.conflicts_state.lock().clone()
    }

    // ------------------------------------------------------------------
    // Operations

    /// Submit a mutating operation; streams progress and refreshes state
    /// once it finishes.
    pub async fn run_operation(
        self: &Arc<Self>,
        cwd: PathBuf,
        op: RunnableOperation,
        progress: ProgressSender,
    ) -> Result<RunResult> {
        let result = self.queue.run_or_queue(cwd, op, progress).await;
        // The working copy almost certainly changed; refresh regardless of
        // how the operation ended.
        self.request_fetch(FetchKind::Everything);
        result
    }

    pub fn abort_running_operation(&self, id: &isl_model::OperationId) {
        self.queue.abort_running_operation(id);
    }

    pub fn operation_queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Tear down background tasks and subscriber lists. Invoked by the
    /// cache when the last reference drops; a disposed repository is never
    /// reused.
    pub fn dispose(&self) {
        info!(repo_root = %self.details.repo_root.display(), "disposing repository");
        self.poller.dispose();
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        self.commits_subs.lock().clear();
        self.uncommitted_subs.lock().clear();
        self.conflicts_subs.lock().clear();
        self.began_subs.lock().clear();
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Deserialize)]
struct StatusEntry {
    path: String,
    status: String,
}

/// Parse `status -Tjson` output into repo-relative changed files. Unknown
/// status letters are skipped rather than failing the whole fetch.
pub(crate) fn parse_status_output(stdout: &str) -> Result<Vec<ChangedFile>> {
    let entries: Vec<StatusEntry> = serde_json::from_str(stdout)?;
    Ok(entries
        .into_iter()
        .filter_map(|e| {
            FileStatus::from_letter(&e.status).map(|status| ChangedFile {
                path: e.path,
                status,
            })
        })
        .collect())
}

/// Stderr patterns indicating a retryable condition rather than a real
/// failure.
fn is_transient_stderr(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["checkout is in progress", "update is in progress"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_output_parses_and_skips_unknown() {
        let stdout = r#"[
            {"path": "src/lib.rs", "status": "M"},
            {"path": "new.txt", "status": "?"},
            {"path": "weird.bin", "status": "Z"}
        ]"#;
        let files = parse_status_output(stdout).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].status, FileStatus::Modified);
        assert_eq!(files[1].status, FileStatus::Untracked);
    }

    #[test]
    fn transient_markers_match_case_insensitively() {
        assert!(is_transient_stderr("abort: Checkout is in progress!"));
        assert!(!is_transient_stderr("abort: no repository found"));
    }
}
