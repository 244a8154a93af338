use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IslError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("'{0}' is not an executable source-control command")]
    InvalidCommand(String),

    #[error("{} is not inside a repository", .0.display())]
    CwdNotARepository(PathBuf),

    #[error("{} does not exist", .0.display())]
    CwdDoesNotExist(PathBuf),

    #[error("state directory {} has insecure permissions or is a symlink", .0.display())]
    InsecureStateDir(PathBuf),

    #[error("server record not found: {0}")]
    NotFound(String),

    #[error("process timed out after {0:?}")]
    TimedOut(Duration),

    #[error("process was killed")]
    Killed,

    #[error("command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("no commits fetched")]
    NoCommitsFetched,

    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    #[error("operation rejected: {0}")]
    OperationRejected(String),

    #[error("repository was disposed")]
    RepositoryDisposed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IslError {
    /// Transient errors are dropped rather than stored; the next poll
    /// retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, IslError::TransientFetch(_))
    }
}

pub type Result<T> = std::result::Result<T, IslError>;
