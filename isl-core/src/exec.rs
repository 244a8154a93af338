//! Subprocess execution with structured stdio, timeouts, and cancellation.
//!
//! Every source-control invocation goes through here so the environment
//! overlay is applied uniformly: user aliases, editors, and locale quirks
//! must never leak into command behavior.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IslError, Result};

/// Grace period between the terminate signal and a hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// Options for one subprocess invocation.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: PathBuf,
    /// `None` means no timeout.
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
    /// Extra environment entries, applied before the fixed overlay.
    pub extra_env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            timeout: None,
            stdin: None,
            extra_env: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }
}

/// Buffered result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a nonzero exit into an error, keeping stderr for context.
    pub fn into_result(self) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(IslError::CommandFailed {
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Events emitted by [`stream_command`], in order: one `Spawn`, any number
/// of `Stdout`/`Stderr` chunks, then at most one `Exit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawn,
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

/// Fixed environment overlay for every source-control subprocess: force a
/// UTF-8 locale, mark the invocation as automated so aliases and fancy
/// output are disabled, and clear any configured editors.
fn apply_scm_env(cmd: &mut Command) {
    cmd.env("LANG", "C.UTF-8");
    cmd.env("LC_ALL", "C.UTF-8");
    cmd.env("HGENCODING", "UTF-8");
    cmd.env("SL_ENCODING", "UTF-8");
    cmd.env("HGPLAIN", "1");
    cmd.env("SL_AUTOMATION", "true");
    for key in ["EDITOR", "VISUAL", "HGUSER", "HGEDITOR"] {
        cmd.env_remove(key);
    }
}

fn build_command(program: &str, args: &[String], opts: &ExecOptions) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&opts.cwd);
    for (key, value) in &opts.extra_env {
        cmd.env(key, value);
    }
    apply_scm_env(&mut cmd);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.kill_on_drop(true);
    cmd
}

/// Send the platform terminate signal; hard-kill after [`KILL_GRACE`].
async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(KILL_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn pump<F>(
    mut reader: impl AsyncReadExt + Unpin,
    events: mpsc::UnboundedSender<ProcessEvent>,
    wrap: F,
) where
    F: Fn(String) -> ProcessEvent,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if events.send(wrap(chunk)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Run a command, streaming its lifecycle as [`ProcessEvent`]s.
///
/// `Spawn` is emitted immediately after invocation. Cancellation and timeout
/// both run the terminate-then-kill sequence; they are distinguished by the
/// returned error (`Killed` vs `TimedOut`). `Exit` is emitted at most once,
/// after both output pipes have drained, so chunk events never trail it.
pub async fn stream_command(
    program: &str,
    args: &[String],
    opts: ExecOptions,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> Result<i32> {
    debug!(program, ?args, cwd = %opts.cwd.display(), "spawning");
    let stdin_bytes = opts.stdin.clone();
    let timeout = opts.timeout;
    let mut cmd = build_command(program, args, &opts);
    let mut child = cmd.spawn()?;
    let _ = events.send(ProcessEvent::Spawn);

    if let Some(bytes) = stdin_bytes {
        if let Some(mut stdin) = child.stdin.take() {
            // Best-effort: a child that exits early closes the pipe.
            let _ = stdin.write_all(&bytes).await;
            let _ = stdin.shutdown().await;
        }
    }

    let stdout = child.stdout.take().ok_or_else(|| {
        IslError::Internal("child stdout was not piped".to_owned())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        IslError::Internal("child stderr was not piped".to_owned())
    })?;
    let out_task = tokio::spawn(pump(stdout, events.clone(), ProcessEvent::Stdout));
    let err_task = tokio::spawn(pump(stderr, events.clone(), ProcessEvent::Stderr));

    enum Outcome {
        Exited(std::process::ExitStatus),
        Cancelled,
        TimedOut(Duration),
    }

    let outcome = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            status = &mut wait => Outcome::Exited(status?),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending::<()>().await,
                }
            } => Outcome::TimedOut(timeout.unwrap_or_default()),
        }
    };

    match outcome {
        Outcome::Exited(status) => {
            let _ = out_task.await;
            let _ = err_task.await;
            let code = status.code().unwrap_or(-1);
            let _ = events.send(ProcessEvent::Exit(code));
            Ok(code)
        }
        Outcome::Cancelled => {
            terminate_then_kill(&mut child).await;
            out_task.abort();
            err_task.abort();
            Err(IslError::Killed)
        }
        Outcome::TimedOut(after) => {
            terminate_then_kill(&mut child).await;
            out_task.abort();
            err_task.abort();
            Err(IslError::TimedOut(after))
        }
    }
}

/// Run a command to completion, buffering stdout and stderr.
pub async fn run_command(
    program: &str,
    args: &[String],
    opts: ExecOptions,
) -> Result<CommandOutput> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let exit_code = stream_command(program, args, opts, cancel, tx).await?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ProcessEvent::Stdout(chunk) => stdout.push_str(&chunk),
            ProcessEvent::Stderr(chunk) => stderr.push_str(&chunk),
            ProcessEvent::Spawn | ProcessEvent::Exit(_) => {}
        }
    }
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_owned(), script.to_owned()]
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_command(
            "sh",
            &sh("echo hello; echo oops >&2; exit 3"),
            ExecOptions::new("/tmp"),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = run_command(
            "sh",
            &sh("cat"),
            ExecOptions::new("/tmp").stdin("from stdin"),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "from stdin");
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let code = stream_command(
            "sh",
            &sh("printf out; printf err >&2"),
            ExecOptions::new("/tmp"),
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.first(), Some(&ProcessEvent::Spawn));
        assert_eq!(events.last(), Some(&ProcessEvent::Exit(0)));
        let exits = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::Exit(_)))
            .count();
        assert_eq!(exits, 1);
        assert!(events.contains(&ProcessEvent::Stdout("out".to_owned())));
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_kill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = stream_command(
            "sh",
            &sh("sleep 30"),
            ExecOptions::new("/tmp").timeout(Duration::from_millis(50)),
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IslError::TimedOut(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = stream_command(
            "sh",
            &sh("sleep 30"),
            ExecOptions::new("/tmp"),
            cancel,
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IslError::Killed));
    }

    #[tokio::test]
    async fn editor_env_is_cleared() {
        let mut opts = ExecOptions::new("/tmp");
        opts.extra_env
            .push(("EDITOR".to_owned(), "vim".to_owned()));
        let out = run_command("sh", &sh("printf \"$EDITOR|$LANG\""), opts)
            .await
            .unwrap();
        assert_eq!(out.stdout, "|C.UTF-8");
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let err = run_command(
            "definitely-not-a-real-binary",
            &[],
            ExecOptions::new("/tmp"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IslError::Io(_)));
    }
}
