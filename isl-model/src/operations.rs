use serde::{Deserialize, Serialize};

use crate::ids::OperationId;

/// A structured argument token, normalized by the operation queue against
/// the target repository before the command is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StructuredArg {
    /// A repo-root-relative path, rewritten to be cwd-relative.
    RepoRelativeFile { path: String },
    /// A revset that should follow rewrites: wrapped in
    /// `max(successors(...))`.
    SucceedableRevset { revset: String },
    /// A revset used verbatim.
    ExactRevset { revset: String },
    /// An allowlisted `--config key=value` pair.
    Config { key: String, value: String },
}

/// One argument of an operation: either a literal string or a structured
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationArg {
    Raw(String),
    Structured(StructuredArg),
}

impl From<&str> for OperationArg {
    fn from(s: &str) -> Self {
        OperationArg::Raw(s.to_owned())
    }
}

/// Which executable runs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandRunner {
    #[serde(rename = "sl")]
    Sapling,
    CodeReviewProvider,
}

/// A mutating command submitted by the client, executed through the
/// per-repository operation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableOperation {
    pub id: OperationId,
    pub args: Vec<OperationArg>,
    pub runner: CommandRunner,
    pub track_event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Streaming progress of a queued or running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OperationProgress {
    /// Emitted immediately when an operation enters the queue behind a
    /// running one. `queue` lists the pending ids in order.
    Queue { queue: Vec<OperationId> },
    Spawn { queue: Vec<OperationId> },
    Stdout { message: String },
    Stderr { message: String },
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: i32 },
    Error { error: String },
    /// The operation never ran: an earlier queued operation failed.
    Skipped,
}
