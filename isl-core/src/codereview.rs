//! Classification of a repository's default remote into a code review
//! system.
//!
//! Remote URLs come in several shapes (https, scp-like ssh, `git+ssh`,
//! schemeless); all are reduced to `(hostname, owner, repo)`. github.com is
//! recognized directly; other hosts are probed once through the GitHub CLI
//! and the answer cached per hostname.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use isl_model::CodeReviewSystem;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::exec::{self, ExecOptions};

/// Answers whether a hostname is a GitHub (Enterprise) instance the user is
/// authenticated against. Injectable so classification is testable without
/// the network.
#[async_trait]
pub trait GitHubAuthProbe: Send + Sync {
    async fn is_github_host(&self, hostname: &str) -> bool;
}

/// Probes via `gh auth status --hostname <host>`.
#[derive(Debug)]
pub struct GhCliProbe;

#[async_trait]
impl GitHubAuthProbe for GhCliProbe {
    async fn is_github_host(&self, hostname: &str) -> bool {
        let args = vec![
            "auth".to_owned(),
            "status".to_owned(),
            "--hostname".to_owned(),
            hostname.to_owned(),
        ];
        let opts = ExecOptions::new(std::env::temp_dir())
            .timeout(std::time::Duration::from_secs(10));
        match exec::run_command("gh", &args, opts).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }
}

/// Per-hostname cache in front of a [`GitHubAuthProbe`].
pub struct HostnameChecker {
    probe: Arc<dyn GitHubAuthProbe>,
    cache: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for HostnameChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostnameChecker").finish()
    }
}

impl HostnameChecker {
    pub fn new(probe: Arc<dyn GitHubAuthProbe>) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_github_host(&self, hostname: &str) -> bool {
        if hostname == "github.com" {
            return true;
        }
        if let Some(cached) = self.cache.lock().get(hostname) {
            return *cached;
        }
        let answer = self.probe.is_github_host(hostname).await;
        debug!(hostname, answer, "probed hostname for GitHub");
        self.cache.lock().insert(hostname.to_owned(), answer);
        answer
    }
}

/// A remote URL reduced to its parts. `repo` keeps interior dots; only a
/// trailing `.git` is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParts {
    pub hostname: String,
    pub owner: String,
    pub repo: String,
}

/// Split a remote URL into hostname/owner/repo. Accepts
/// `https://host/owner/repo(.git)?`, `host/owner/repo.git`,
/// `git@host:owner/repo.git`, `ssh://git@host/owner/repo.git`, and
/// `git+ssh://git@host:owner/repo.git`.
pub fn parse_remote_url(remote: &str) -> Option<RemoteParts> {
    let remote = remote.trim();

    // scp-like and ssh forms first; Url::parse mangles `git@host:path`.
    let ssh_re = Regex::new(
        r"^(?:git\+ssh://|ssh://)?git@(?P<host>[^:/]+)[:/](?P<path>.+)$",
    )
    .ok()?;
    if let Some(caps) = ssh_re.captures(remote) {
        return split_owner_repo(&caps["host"], &caps["path"]);
    }

    if remote.starts_with("https://") || remote.starts_with("http://") {
        let url = Url::parse(remote).ok()?;
        let host = url.host_str()?;
        return split_owner_repo(host, url.path().trim_start_matches('/'));
    }

    // Schemeless `host/owner/repo.git`.
    if remote.ends_with(".git") && remote.contains('/') {
        let (host, path) = remote.split_once('/')?;
        return split_owner_repo(host, path);
    }

    None
}

fn split_owner_repo(host: &str, path: &str) -> Option<RemoteParts> {
    let path = path.trim_matches('/');
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }
    Some(RemoteParts {
        hostname: host.to_owned(),
        owner: owner.to_owned(),
        repo: repo.to_owned(),
    })
}

/// Classify a repository's `paths.default` into a code review system.
pub async fn classify_remote(
    remote: Option<&str>,
    checker: &HostnameChecker,
) -> CodeReviewSystem {
    let Some(remote) = remote.map(str::trim).filter(|r| !r.is_empty()) else {
        return CodeReviewSystem::None;
    };
    match parse_remote_url(remote) {
        Some(parts) => {
            if parts.hostname.contains("phabricator") {
                CodeReviewSystem::Phabricator { repo: parts.repo }
            } else if checker.is_github_host(&parts.hostname).await {
                CodeReviewSystem::Github {
                    owner: parts.owner,
                    repo: parts.repo,
                    hostname: parts.hostname,
                }
            } else {
                CodeReviewSystem::Unknown {
                    path: Some(remote.to_owned()),
                }
            }
        }
        None => CodeReviewSystem::Unknown {
            path: Some(remote.to_owned()),
        },
    }
}

/// Capability surface of a concrete review provider; the server consumes
/// this without knowing which provider backs it.
#[async_trait]
pub trait CodeReviewProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Fetch summaries for the diffs attached to local commits.
    async fn fetch_diff_summaries(
        &self,
    ) -> crate::error::Result<serde_json::Value>;
}
