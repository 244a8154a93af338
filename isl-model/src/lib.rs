//! Core data model definitions shared across ISL crates.
//!
//! Everything in this crate is plain data: repo metadata, commit and
//! conflict snapshots, operation descriptions, the client↔server wire
//! protocol, and the persisted server record. No I/O lives here.
#![allow(missing_docs)]

pub mod commits;
pub mod conflicts;
pub mod ids;
pub mod messages;
pub mod operations;
pub mod repo;
pub mod server_record;

// Intentionally curated re-exports for downstream consumers.
pub use commits::{
    ChangedFile, CommitInfo, CommitPhase, FileStatus, GeneratedStatus,
    ShelvedChange, SmartlogCommits, SuccessorInfo, UncommittedChanges,
};
pub use conflicts::{ConflictFile, ConflictStatus, MergeConflicts};
pub use ids::{OperationId, PageId, SubscriptionId};
pub use messages::{
    ApplicationInfo, ClientMessage, CommitCloudState, Comparison, FetchKind,
    PageVisibility, Platform, PollKind, ServerMessage, SubscriptionData,
    SubscriptionKind, WireResult,
};
pub use operations::{
    CommandRunner, OperationArg, OperationProgress, RunnableOperation,
    StructuredArg,
};
pub use repo::{CodeReviewSystem, PreferredSubmitCommand, RepoInfo};
pub use server_record::{ChallengeResponse, ServerRecord};
