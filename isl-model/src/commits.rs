use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status letter of one file as reported by the tool's JSON status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    #[serde(rename = "M")]
    Modified,
    #[serde(rename = "A")]
    Added,
    #[serde(rename = "R")]
    Removed,
    #[serde(rename = "?")]
    Untracked,
    #[serde(rename = "!")]
    Missing,
    #[serde(rename = "U")]
    Unresolved,
}

impl FileStatus {
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "M" => Some(Self::Modified),
            "A" => Some(Self::Added),
            "R" => Some(Self::Removed),
            "?" => Some(Self::Untracked),
            "!" => Some(Self::Missing),
            "U" => Some(Self::Unresolved),
            _ => None,
        }
    }
}

/// One changed file, path repo-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
}

/// Snapshot of the working copy's uncommitted changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncommittedChanges {
    pub files: Vec<ChangedFile>,
    pub fetch_started_at: DateTime<Utc>,
    pub fetch_completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPhase {
    Public,
    Draft,
}

/// Where a rewritten commit went, from the mutation metadata.
///
/// Only the first successor is ever surfaced; a commit split into many is
/// still reported with a single hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessorInfo {
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One commit in the smartlog view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub title: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub parents: Vec<String>,
    pub phase: CommitPhase,
    pub bookmarks: Vec<String>,
    pub remote_bookmarks: Vec<String>,
    /// Whether this commit is the working copy parent.
    pub is_dot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor_info: Option<SuccessorInfo>,
    pub total_file_count: u64,
    /// A bounded sample of the files changed by this commit.
    pub files_sample: Vec<ChangedFile>,
    /// Full commit message; the only field allowed to span lines.
    pub description: String,
}

/// Snapshot of the fetched smartlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartlogCommits {
    pub commits: Vec<CommitInfo>,
    pub fetch_started_at: DateTime<Utc>,
    pub fetch_completed_at: DateTime<Utc>,
}

/// One shelved (stashed) change, as listed by the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelvedChange {
    pub hash: String,
    pub name: String,
    pub date: DateTime<Utc>,
    pub description: String,
}

/// Whether a file is human-written, tool-generated, or a mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GeneratedStatus {
    Manual,
    Generated,
    PartiallyGenerated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_letters() {
        assert_eq!(FileStatus::from_letter("M"), Some(FileStatus::Modified));
        assert_eq!(FileStatus::from_letter("?"), Some(FileStatus::Untracked));
        assert_eq!(FileStatus::from_letter("X"), None);
        let json = serde_json::to_string(&FileStatus::Missing).unwrap();
        assert_eq!(json, r#""!""#);
    }
}
