//! Repository discovery: resolve the repo root, dotdir, and review-system
//! classification for a cwd.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use isl_model::{PreferredSubmitCommand, RepoInfo};
use tracing::{debug, warn};

use crate::codereview::{self, HostnameChecker};
use crate::error::{IslError, Result};
use crate::exec::{self, ExecOptions};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default hold-off window between a running operation and background
/// refreshes; `isl.hold-off-refresh-ms` overrides it.
pub const DEFAULT_HOLD_OFF: Duration = Duration::from_secs(10);

const KNOWN_CONFIGS: &[&str] = &[
    "paths.default",
    "github.pull_request_domain",
    "github.preferred_submit_command",
    "isl.hold-off-refresh-ms",
];

/// What a caller asks the cache for: a command and a working directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryContext {
    pub command: String,
    pub cwd: PathBuf,
}

impl RepositoryContext {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }
}

/// Repo-level settings read during discovery but not part of the
/// client-visible `RepoInfo`.
#[derive(Debug, Clone)]
pub struct RepoSettings {
    pub hold_off_refresh: Duration,
}

impl Default for RepoSettings {
    fn default() -> Self {
        Self {
            hold_off_refresh: DEFAULT_HOLD_OFF,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub info: RepoInfo,
    pub settings: RepoSettings,
}

impl Discovery {
    fn error(info: RepoInfo) -> Self {
        Self {
            info,
            settings: RepoSettings::default(),
        }
    }
}

/// Resolve repo metadata for `ctx`. Expected failures (missing binary, cwd
/// outside any repo) come back as `RepoInfo` variants; only unexpected I/O
/// surfaces as `Err`.
pub async fn get_repo_info(
    ctx: &RepositoryContext,
    checker: &HostnameChecker,
) -> Result<Discovery> {
    match tokio::fs::try_exists(&ctx.cwd).await {
        Ok(true) => {}
        Ok(false) => {
            return Ok(Discovery::error(RepoInfo::CwdDoesNotExist {
                cwd: ctx.cwd.clone(),
            }));
        }
        Err(e) => return Err(e.into()),
    }

    let root_out = match run_tool(ctx, &["root"]).await {
        Ok(out) => out,
        Err(IslError::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            return Ok(Discovery::error(RepoInfo::InvalidCommand {
                command: ctx.command.clone(),
            }));
        }
        Err(e) => return Err(e),
    };
    if !root_out.success() {
        // Windows reports a missing binary as a shell error rather than a
        // spawn failure.
        if root_out.stderr.contains("is not recognized") {
            return Ok(Discovery::error(RepoInfo::InvalidCommand {
                command: ctx.command.clone(),
            }));
        }
        debug!(stderr = %root_out.stderr.trim(), "root lookup failed");
        return Ok(Discovery::error(RepoInfo::CwdNotARepository {
            cwd: ctx.cwd.clone(),
        }));
    }
    let repo_root = PathBuf::from(root_out.stdout.trim());

    let dotdir = match run_tool(ctx, &["root", "--dotdir"]).await {
        Ok(out) if out.success() => PathBuf::from(out.stdout.trim()),
        _ => {
            warn!("could not resolve dotdir, assuming .sl");
            repo_root.join(".sl")
        }
    };

    let configs = read_known_configs(ctx).await;
    let code_review_system = codereview::classify_remote(
        configs.get("paths.default").map(String::as_str),
        checker,
    )
    .await;
    let pull_request_domain =
        configs.get("github.pull_request_domain").cloned();
    let preferred_submit_command = configs
        .get("github.preferred_submit_command")
        .and_then(|v| PreferredSubmitCommand::parse(v));
    let hold_off_refresh = configs
        .get("isl.hold-off-refresh-ms")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_HOLD_OFF);

    Ok(Discovery {
        info: RepoInfo::Success {
            command: ctx.command.clone(),
            repo_root,
            dotdir,
            code_review_system,
            pull_request_domain,
            preferred_submit_command,
        },
        settings: RepoSettings { hold_off_refresh },
    })
}

async fn run_tool(
    ctx: &RepositoryContext,
    args: &[&str],
) -> Result<exec::CommandOutput> {
    let args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
    exec::run_command(
        &ctx.command,
        &args,
        ExecOptions::new(&ctx.cwd).timeout(DISCOVERY_TIMEOUT),
    )
    .await
}

/// One batched `config` read for every key discovery cares about. A nonzero
/// exit only means some keys are unset; whatever did print still parses.
async fn read_known_configs(ctx: &RepositoryContext) -> HashMap<String, String> {
    let mut args = vec!["config"];
    args.extend_from_slice(KNOWN_CONFIGS);
    match run_tool(ctx, &args).await {
        Ok(out) => parse_config_output(&out.stdout),
        Err(e) => {
            warn!(error = %e, "config read failed");
            HashMap::new()
        }
    }
}

/// Parse `name=value` lines as printed when multiple config names are
/// requested at once.
pub(crate) fn parse_config_output(stdout: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            if KNOWN_CONFIGS.contains(&name) && !value.trim().is_empty() {
                out.insert(name.to_owned(), value.trim().to_owned());
            }
        }
    }
    out
}
