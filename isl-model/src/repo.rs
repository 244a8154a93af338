use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which code review system a repository's default remote points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CodeReviewSystem {
    #[serde(rename_all = "camelCase")]
    Github {
        owner: String,
        repo: String,
        /// github.com, or the host of a GitHub Enterprise instance.
        hostname: String,
    },
    Phabricator {
        repo: String,
    },
    /// Repository has no default remote configured.
    None,
    /// Remote exists but does not match any supported review system.
    #[serde(rename_all = "camelCase")]
    Unknown { path: Option<String> },
}

/// The user's configured preference for submitting stacks for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredSubmitCommand {
    Pr,
    Ghstack,
    Push,
}

impl PreferredSubmitCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "pr" => Some(Self::Pr),
            "ghstack" => Some(Self::Ghstack),
            "push" => Some(Self::Push),
            _ => None,
        }
    }
}

/// Outcome of repository discovery for a given cwd.
///
/// The error variants are data, not exceptions: they travel to the client as
/// a normal `repoInfo` message so the UI can render them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RepoInfo {
    #[serde(rename_all = "camelCase")]
    Success {
        /// Name of the source-control command this repo was discovered with.
        command: String,
        /// Absolute path to the repository root.
        repo_root: PathBuf,
        /// Absolute path to the repository's dot directory (e.g. `.sl`).
        dotdir: PathBuf,
        code_review_system: CodeReviewSystem,
        #[serde(skip_serializing_if = "Option::is_none")]
        pull_request_domain: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        preferred_submit_command: Option<PreferredSubmitCommand>,
    },
    /// The source-control binary is missing or not executable.
    InvalidCommand { command: String },
    /// The cwd exists but is not inside a repository.
    CwdNotARepository { cwd: PathBuf },
    /// The cwd itself does not exist.
    CwdDoesNotExist { cwd: PathBuf },
}

impl RepoInfo {
    pub fn is_success(&self) -> bool {
        matches!(self, RepoInfo::Success { .. })
    }

    pub fn repo_root(&self) -> Option<&PathBuf> {
        match self {
            RepoInfo::Success { repo_root, .. } => Some(repo_root),
            _ => None,
        }
    }
}
