//! Repository engine for the ISL server.
//!
//! Everything that touches the source-control tool or holds repository
//! state lives here: discovery, the reference-counted repository cache, the
//! serialized operation queue, the focus-aware poller, merge-conflict
//! tracking, and the subprocess runner underneath them all. The HTTP and
//! WebSocket surface lives in the server crate; this crate never touches a
//! socket.

pub mod cache;
pub mod codereview;
pub mod error;
pub mod exec;
pub mod queue;
pub mod repository;
pub mod serverdir;
pub mod watch;

pub use cache::{RepoError, RepoResolution, RepositoryCache, RepositoryReference};
pub use codereview::{GhCliProbe, GitHubAuthProbe, HostnameChecker};
pub use error::{IslError, Result};
pub use queue::{ProgressSender, RunResult};
pub use repository::{
    Discovery, RepoDetails, RepoSettings, Repository, RepositoryContext,
};
pub use serverdir::{generate_token, tokens_equal, ServerDir};
pub use watch::{PollerConfig, WatchForChanges};
