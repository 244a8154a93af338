//! The typed client↔server wire protocol.
//!
//! Every message is one JSON text frame, internally tagged by `type`. A
//! message carrying `hasBinaryPayload: true` is followed by exactly one
//! binary frame which the router attaches before dispatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commits::{
    ChangedFile, CommitInfo, GeneratedStatus, ShelvedChange, SmartlogCommits,
    UncommittedChanges,
};
use crate::conflicts::MergeConflicts;
use crate::ids::{OperationId, PageId, SubscriptionId};
use crate::operations::{OperationProgress, RunnableOperation};
use crate::repo::RepoInfo;

/// Fallible payloads cross the wire as plain data so the UI can render the
/// error; they are never surfaced as transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireResult<T> {
    Err { error: String },
    Ok(T),
}

impl<T> WireResult<T> {
    pub fn from_result<E: std::fmt::Display>(r: Result<T, E>) -> Self {
        match r {
            Ok(value) => WireResult::Ok(value),
            Err(e) => WireResult::Err {
                error: e.to_string(),
            },
        }
    }
}

/// The UI surface a connection belongs to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    #[default]
    Browser,
    AndroidStudio,
    AndroidStudioRemote,
    VsCode,
    Standalone,
}

impl Platform {
    /// URL path the UI for this platform is served from. The browser UI
    /// lives at the root; embedded surfaces each get their own entry page.
    pub fn url_path(&self) -> &'static str {
        match self {
            Platform::Browser => "",
            Platform::AndroidStudio => "platform/androidStudio.html",
            Platform::AndroidStudioRemote => {
                "platform/androidStudioRemote.html"
            }
            Platform::VsCode => "platform/vscode.html",
            Platform::Standalone => "platform/standalone.html",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "browser" => Some(Platform::Browser),
            "androidStudio" => Some(Platform::AndroidStudio),
            "androidStudioRemote" => Some(Platform::AndroidStudioRemote),
            "vscode" => Some(Platform::VsCode),
            "standalone" => Some(Platform::Standalone),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Browser => "browser",
            Platform::AndroidStudio => "androidStudio",
            Platform::AndroidStudioRemote => "androidStudioRemote",
            Platform::VsCode => "vscode",
            Platform::Standalone => "standalone",
        }
    }
}

/// Visibility of one connected page, reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageVisibility {
    Focused,
    Visible,
    Hidden,
}

/// What kind of repository state a fetch or poll concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchKind {
    UncommittedChanges,
    Commits,
    MergeConflicts,
    Everything,
}

/// Why a poll fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollKind {
    /// Explicit request; bypasses hold-off and cadence.
    Force,
    /// External watcher reported a change.
    Hint,
    /// Cadence timer fired.
    Polling,
}

/// Kinds of state a client can subscribe to for push updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    UncommittedChanges,
    SmartlogCommits,
    MergeConflicts,
}

/// Which diff the client wants to view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Comparison {
    UncommittedChanges,
    HeadChanges,
    StackChanges,
    Committed { hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub platform_name: String,
    pub version: String,
    pub log_file_path: String,
}

/// State fetched from `cloud status`, best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitCloudState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

/// Messages sent by the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Heartbeat {
        id: String,
    },
    ChangeCwd {
        cwd: String,
    },
    RequestRepoInfo,
    RequestApplicationInfo,
    #[serde(rename_all = "camelCase")]
    PageVisibility {
        page: PageId,
        state: PageVisibility,
    },
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(rename = "subscriptionID")]
        subscription_id: SubscriptionId,
        kind: SubscriptionKind,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        #[serde(rename = "subscriptionID")]
        subscription_id: SubscriptionId,
    },
    RunOperation {
        operation: RunnableOperation,
    },
    #[serde(rename_all = "camelCase")]
    AbortRunningOperation {
        operation_id: OperationId,
    },
    /// Re-fetch everything, bypassing hold-off.
    Refresh,
    /// Widen the smartlog's visible commit range and refetch.
    LoadMoreCommits,
    GetConfig {
        id: String,
        name: String,
    },
    SetConfig {
        name: String,
        value: String,
    },
    RequestComparison {
        comparison: Comparison,
    },
    #[serde(rename_all = "camelCase")]
    RequestComparisonContextLines {
        id: String,
        path: String,
        start: u64,
        num_lines: u64,
    },
    FetchShelvedChanges {
        id: String,
    },
    FetchLatestCommit {
        id: String,
        revset: String,
    },
    FetchAllCommitChangedFiles {
        id: String,
        hash: String,
    },
    FetchCommitCloudState {
        id: String,
    },
    FetchGeneratedStatuses {
        id: String,
        paths: Vec<String>,
    },
    FetchDiffSummaries,
    ExportStack {
        id: String,
        revs: String,
    },
    ImportStack {
        id: String,
        stack: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    UploadFile {
        id: String,
        filename: String,
        has_binary_payload: bool,
    },
}

impl ClientMessage {
    /// Whether this message announces a binary continuation frame.
    pub fn expects_binary_payload(&self) -> bool {
        matches!(
            self,
            ClientMessage::UploadFile {
                has_binary_payload: true,
                ..
            }
        )
    }
}

/// Data pushed through an active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubscriptionData {
    UncommittedChanges {
        data: WireResult<UncommittedChanges>,
    },
    SmartlogCommits {
        data: WireResult<SmartlogCommits>,
    },
    MergeConflicts {
        /// `None` when no merge is in progress.
        data: Option<MergeConflicts>,
    },
}

/// Messages sent by the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Heartbeat {
        id: String,
    },
    RepoInfo {
        info: RepoInfo,
    },
    ApplicationInfo {
        info: ApplicationInfo,
    },
    /// State began fetching; lets the UI show a spinner before data lands.
    BeganFetching {
        kind: FetchKind,
    },
    #[serde(rename_all = "camelCase")]
    SubscriptionResult {
        #[serde(rename = "subscriptionID")]
        subscription_id: SubscriptionId,
        #[serde(flatten)]
        data: SubscriptionData,
    },
    OperationProgress {
        id: OperationId,
        #[serde(flatten)]
        progress: OperationProgress,
    },
    GotConfig {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    Comparison {
        comparison: Comparison,
        diff: WireResult<String>,
    },
    ComparisonContextLines {
        id: String,
        lines: WireResult<Vec<String>>,
    },
    FetchedShelvedChanges {
        id: String,
        shelves: WireResult<Vec<ShelvedChange>>,
    },
    FetchedLatestCommit {
        id: String,
        revset: String,
        info: WireResult<CommitInfo>,
    },
    FetchedAllCommitChangedFiles {
        id: String,
        hash: String,
        files: WireResult<Vec<ChangedFile>>,
    },
    FetchedCommitCloudState {
        id: String,
        state: WireResult<CommitCloudState>,
    },
    FetchedGeneratedStatuses {
        id: String,
        results: HashMap<String, GeneratedStatus>,
    },
    FetchedDiffSummaries {
        summaries: WireResult<serde_json::Value>,
    },
    ExportedStack {
        id: String,
        revs: String,
        stack: WireResult<serde_json::Value>,
    },
    ImportedStack {
        id: String,
        imported: WireResult<serde_json::Value>,
    },
    UploadedFile {
        id: String,
        result: WireResult<String>,
    },
}
