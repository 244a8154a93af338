//! Serial execution of mutating source-control commands.
//!
//! At most one operation runs per repository; later submissions queue FIFO
//! and stream their progress only once they start. A failed operation drops
//! the entire pending queue so dependent steps never run against a broken
//! working copy.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use isl_model::{
    CommandRunner, OperationArg, OperationId, OperationProgress,
    RunnableOperation, StructuredArg,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{IslError, Result};
use crate::exec::{self, ExecOptions, ProcessEvent};

/// `--config` keys operations are allowed to override.
const CONFIG_ALLOWLIST: &[&str] = &[
    "ui.merge",
    "ui.allowemptycommit",
    "amend.autorestack",
    "rebase.experimental.inmemory",
];

/// Subcommands never run on behalf of a client.
const REJECTED_COMMANDS: &[&str] = &["debugsh", "debugshell"];

/// Per-operation progress events, tagged with the operation id.
pub type ProgressSender = mpsc::UnboundedSender<(OperationId, OperationProgress)>;

/// Whether a submitted operation actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Ran,
    /// Dropped because an earlier queued operation failed.
    Skipped,
}

struct QueuedOp {
    op: RunnableOperation,
    args: Vec<String>,
    cwd: PathBuf,
    progress: ProgressSender,
    done: oneshot::Sender<RunResult>,
}

struct RunningOp {
    id: OperationId,
    cancel: CancellationToken,
    started: Instant,
}

type DrainSeed = (
    RunnableOperation,
    Vec<String>,
    PathBuf,
    ProgressSender,
    CancellationToken,
);

enum EnqueueOutcome {
    Queued(oneshot::Receiver<RunResult>),
    Start(DrainSeed),
}

#[derive(Default)]
struct QueueState {
    running: Option<RunningOp>,
    queue: VecDeque<QueuedOp>,
}

/// FIFO queue of mutating operations for one repository.
pub struct OperationQueue {
    /// Source-control command name, e.g. `sl`.
    command: String,
    repo_root: PathBuf,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("command", &self.command)
            .field("repo_root", &self.repo_root)
            .finish()
    }
}

impl OperationQueue {
    pub fn new(command: String, repo_root: PathBuf) -> Self {
        Self {
            command,
            repo_root,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Run `op` now, or queue it behind the running operation.
    ///
    /// Resolves once the operation finished (`Ran`) or was dropped because a
    /// predecessor failed (`Skipped`). Rejected arguments fail before the
    /// operation is queued or spawned.
    pub async fn run_or_queue(
        &self,
        cwd: PathBuf,
        op: RunnableOperation,
        progress: ProgressSender,
    ) -> Result<RunResult> {
        let args = normalize_args(&op, &self.repo_root, &cwd)?;

        match self.begin_or_enqueue(cwd, op, args, progress) {
            EnqueueOutcome::Queued(done_rx) => {
                Ok(done_rx.await.unwrap_or(RunResult::Skipped))
            }
            EnqueueOutcome::Start(first) => {
                self.drain(first).await;
                Ok(RunResult::Ran)
            }
        }
    }

    /// Synchronously claim the running slot or queue behind it. Kept
    /// separate from `run_or_queue` so the lock guard never spans an
    /// `.await` point (parking_lot guards are not `Send`).
    fn begin_or_enqueue(
        &self,
        cwd: PathBuf,
        op: RunnableOperation,
        args: Vec<String>,
        progress: ProgressSender,
    ) -> EnqueueOutcome {
        let mut state = self.state.lock();
        if state.running.is_some() {
            let (done_tx, done_rx) = oneshot::channel();
            let id = op.id.clone();
            state.queue.push_back(QueuedOp {
                op,
                args,
                cwd,
                progress: progress.clone(),
                done: done_tx,
            });
            let pending: Vec<OperationId> =
                state.queue.iter().map(|q| q.op.id.clone()).collect();
            let _ = progress
                .send((id, OperationProgress::Queue { queue: pending }));
            return EnqueueOutcome::Queued(done_rx);
        }
        let cancel = CancellationToken::new();
        state.running = Some(RunningOp {
            id: op.id.clone(),
            cancel: cancel.clone(),
            started: Instant::now(),
        });
        EnqueueOutcome::Start((op, args, cwd, progress, cancel))
    }

    /// Execute `first`, then keep draining the queue until it is empty or an
    /// operation fails.
    async fn drain(
        &self,
        first: (
            RunnableOperation,
            Vec<String>,
            PathBuf,
            ProgressSender,
            CancellationToken,
        ),
    ) {
        let (mut op, mut args, mut cwd, mut progress, mut cancel) = first;
        let mut done: Option<oneshot::Sender<RunResult>> = None;

        loop {
            let failed = self
                .execute(&op, &args, &cwd, &progress, cancel.clone())
                .await;
            if let Some(done) = done.take() {
                let _ = done.send(RunResult::Ran);
            }

            let next = {
                let mut state = self.state.lock();
                if failed {
                    let dropped: Vec<QueuedOp> =
                        state.queue.drain(..).collect();
                    state.running = None;
                    drop(state);
                    if !dropped.is_empty() {
                        warn!(
                            count = dropped.len(),
                            "operation failed, dropping queued operations"
                        );
                    }
                    for q in dropped {
                        let _ = q.done.send(RunResult::Skipped);
                    }
                    return;
                }
                match state.queue.pop_front() {
                    None => {
                        state.running = None;
                        return;
                    }
                    Some(next) => {
                        let token = CancellationToken::new();
                        state.running = Some(RunningOp {
                            id: next.op.id.clone(),
                            cancel: token.clone(),
                            started: Instant::now(),
                        });
                        (next, token)
                    }
                }
            };

            let (queued, token) = next;
            op = queued.op;
            args = queued.args;
            cwd = queued.cwd;
            progress = queued.progress;
            cancel = token;
            done = Some(queued.done);
        }
    }

    /// Run one operation, forwarding subprocess events as progress.
    /// Returns true if the operation failed.
    async fn execute(
        &self,
        op: &RunnableOperation,
        args: &[String],
        cwd: &Path,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> bool {
        info!(id = %op.id, event = %op.track_event_name, "running operation");
        let program = match op.runner {
            CommandRunner::Sapling => self.command.clone(),
            CommandRunner::CodeReviewProvider => "gh".to_owned(),
        };
        let mut opts = ExecOptions::new(cwd);
        if let Some(stdin) = &op.stdin {
            opts = opts.stdin(stdin.clone());
        }

        let pending: Vec<OperationId> = {
            let state = self.state.lock();
            state.queue.iter().map(|q| q.op.id.clone()).collect()
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let forward_progress = progress.clone();
        let forward_id = op.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let mapped = match event {
                    ProcessEvent::Spawn => OperationProgress::Spawn {
                        queue: pending.clone(),
                    },
                    ProcessEvent::Stdout(message) => {
                        OperationProgress::Stdout { message }
                    }
                    ProcessEvent::Stderr(message) => {
                        OperationProgress::Stderr { message }
                    }
                    ProcessEvent::Exit(exit_code) => {
                        OperationProgress::Exit { exit_code }
                    }
                };
                if forward_progress
                    .send((forward_id.clone(), mapped))
                    .is_err()
                {
                    break;
                }
            }
        });

        let result =
            exec::stream_command(&program, args, opts, cancel, events_tx)
                .await;
        let _ = forwarder.await;

        match result {
            Ok(0) => false,
            Ok(code) => {
                info!(id = %op.id, code, "operation exited nonzero");
                true
            }
            Err(e) => {
                let _ = progress.send((
                    op.id.clone(),
                    OperationProgress::Error {
                        error: e.to_string(),
                    },
                ));
                true
            }
        }
    }

    /// Cancel the running operation if its id matches; no-op otherwise.
    pub fn abort_running_operation(&self, id: &OperationId) {
        let state = self.state.lock();
        if let Some(running) = &state.running {
            if running.id == *id {
                info!(%id, "aborting running operation");
                running.cancel.cancel();
            }
        }
    }

    pub fn has_running_operation(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// True while an operation is running and started less than `window`
    /// ago. Non-forced refreshes are suppressed inside this window so long
    /// commands do not surface messy intermediate state right away.
    pub fn within_hold_off(&self, window: Duration) -> bool {
        self.state
            .lock()
            .running
            .as_ref()
            .is_some_and(|r| r.started.elapsed() < window)
    }
}

/// Normalize structured argument tokens against the repository and cwd,
/// enforcing the config allowlist and command denylist.
pub fn normalize_args(
    op: &RunnableOperation,
    repo_root: &Path,
    cwd: &Path,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(op.args.len() + 2);
    for arg in &op.args {
        match arg {
            OperationArg::Raw(s) => {
                if s == "--config" || s.starts_with("--config=") {
                    return Err(IslError::OperationRejected(
                        "raw --config flags are not allowed".to_owned(),
                    ));
                }
                out.push(s.clone());
            }
            OperationArg::Structured(StructuredArg::RepoRelativeFile {
                path,
            }) => {
                let abs = repo_root.join(path);
                out.push(relativize(cwd, &abs).display().to_string());
            }
            OperationArg::Structured(StructuredArg::SucceedableRevset {
                revset,
            }) => {
                out.push(format!("max(successors({revset}))"));
            }
            OperationArg::Structured(StructuredArg::ExactRevset {
                revset,
            }) => {
                out.push(revset.clone());
            }
            OperationArg::Structured(StructuredArg::Config { key, value }) => {
                if !CONFIG_ALLOWLIST.contains(&key.as_str()) {
                    return Err(IslError::OperationRejected(format!(
                        "config '{key}' is not allowlisted"
                    )));
                }
                out.push("--config".to_owned());
                out.push(format!("{key}={value}"));
            }
        }
    }
    if let Some(subcommand) = out.first() {
        if REJECTED_COMMANDS.contains(&subcommand.as_str()) {
            return Err(IslError::OperationRejected(format!(
                "command '{subcommand}' is not allowed"
            )));
        }
    }
    Ok(out)
}

/// Express `target` relative to `base` (both absolute).
fn relativize(base: &Path, target: &Path) -> PathBuf {
    let base_parts: Vec<Component> = base.components().collect();
    let target_parts: Vec<Component> = target.components().collect();
    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
