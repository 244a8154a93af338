use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resolution status of one conflicted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    #[serde(rename = "U")]
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFile {
    pub path: String,
    pub status: ConflictStatus,
}

/// Conflict state of a repository while a merge-like command is active.
///
/// Once a path has been seen as conflicted during the current merge it stays
/// in `files` in every later emission; re-checks only flip its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MergeConflicts {
    Loading,
    #[serde(rename_all = "camelCase")]
    Loaded {
        /// The interrupted command, e.g. `rebase`.
        command: String,
        to_continue: String,
        to_abort: String,
        files: Vec<ConflictFile>,
        fetch_started_at: DateTime<Utc>,
        fetch_completed_at: DateTime<Utc>,
    },
}

impl MergeConflicts {
    pub fn files(&self) -> &[ConflictFile] {
        match self {
            MergeConflicts::Loading => &[],
            MergeConflicts::Loaded { files, .. } => files,
        }
    }
}
