//! Reference-counted cache of `Repository` instances, keyed by repo root.
//!
//! Many client connections share one repository per root. Creation is lazy
//! and race-safe: discovery may run twice for concurrent callers, but at
//! most one `Repository` is retained. The last `unref` disposes the entry;
//! a disposed entry is never resurrected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use isl_model::RepoInfo;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::codereview::HostnameChecker;
use crate::repository::{discovery, Discovery, Repository, RepositoryContext};
use crate::watch::PollerConfig;

/// Why a reference failed to produce a repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("'{0}' is not a valid source-control command")]
    InvalidCommand(String),

    #[error("{} is not inside a repository", .0.display())]
    CwdNotARepository(PathBuf),

    #[error("{} does not exist", .0.display())]
    CwdDoesNotExist(PathBuf),

    #[error("reference was released before discovery finished")]
    Unreffed,

    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl RepoError {
    /// Client-facing `RepoInfo` for this failure. Internal failure modes
    /// collapse to `cwdNotARepository` since the UI treats them the same.
    pub fn as_repo_info(&self, cwd: &Path) -> RepoInfo {
        match self {
            RepoError::InvalidCommand(command) => RepoInfo::InvalidCommand {
                command: command.clone(),
            },
            RepoError::CwdNotARepository(cwd) => {
                RepoInfo::CwdNotARepository { cwd: cwd.clone() }
            }
            RepoError::CwdDoesNotExist(cwd) => {
                RepoInfo::CwdDoesNotExist { cwd: cwd.clone() }
            }
            RepoError::Unreffed | RepoError::Discovery(_) => {
                RepoInfo::CwdNotARepository {
                    cwd: cwd.to_path_buf(),
                }
            }
        }
    }
}

pub type RepoResolution = std::result::Result<Arc<Repository>, RepoError>;

struct CacheEntry {
    repo: Arc<Repository>,
    refcount: usize,
}

struct CacheInner {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    checker: HostnameChecker,
    poller_config: PollerConfig,
}

/// Process-wide repository cache. Initialized at startup, torn down on
/// shutdown; everything else receives it by `Arc`.
#[derive(Clone)]
pub struct RepositoryCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for RepositoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("active_repos", &self.active_repo_count())
            .finish()
    }
}

impl RepositoryCache {
    pub fn new(checker: HostnameChecker, poller_config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                checker,
                poller_config,
            }),
        }
    }

    /// Number of live repositories; used by the server's idle shutdown.
    pub fn active_repo_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Obtain a reference for `ctx`, creating and discovering a repository
    /// if no cached one covers the cwd.
    pub fn get_or_create(&self, ctx: RepositoryContext) -> RepositoryReference {
        if let Some(reference) = self.inner.try_attach(&ctx.cwd) {
            debug!(cwd = %ctx.cwd.display(), "repository cache hit");
            return reference;
        }

        let (tx, rx) = watch::channel(None);
        let reference = RepositoryReference::pending(rx);
        let ref_inner = Arc::clone(&reference.inner);
        let cache = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let resolution = match discovery::get_repo_info(
                &ctx,
                &cache.checker,
            )
            .await
            {
                Err(e) => Err(RepoError::Discovery(e.to_string())),
                Ok(discovered) => match &discovered.info {
                    RepoInfo::InvalidCommand { command } => {
                        Err(RepoError::InvalidCommand(command.clone()))
                    }
                    RepoInfo::CwdNotARepository { cwd } => {
                        Err(RepoError::CwdNotARepository(cwd.clone()))
                    }
                    RepoInfo::CwdDoesNotExist { cwd } => {
                        Err(RepoError::CwdDoesNotExist(cwd.clone()))
                    }
                    RepoInfo::Success { .. } => {
                        cache.bind(&ref_inner, discovered)
                    }
                },
            };
            let _ = tx.send(Some(resolution));
        });
        reference
    }

    /// Tear down every repository, e.g. on SIGTERM.
    pub fn dispose_all(&self) {
        let entries: Vec<CacheEntry> = {
            let mut map = self.inner.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.repo.dispose();
        }
    }

    #[cfg(test)]
    fn refcount(&self, root: &Path) -> Option<usize> {
        self.inner.entries.lock().get(root).map(|e| e.refcount)
    }
}

impl CacheInner {
    /// Fast path: attach to a live repository whose root covers `path`.
    fn try_attach(self: &Arc<Self>, path: &Path) -> Option<RepositoryReference> {
        let mut entries = self.entries.lock();
        let root = longest_prefix_root(&entries, path)?;
        let entry = entries.get_mut(&root)?;
        entry.refcount += 1;
        let repo = Arc::clone(&entry.repo);
        drop(entries);
        Some(RepositoryReference::resolved(
            Arc::clone(self),
            root,
            repo,
        ))
    }

    /// Post-discovery binding. The double-check against the map is the race
    /// safety guarantee: a concurrent caller may have inserted this root
    /// while our discovery ran.
    fn bind(
        self: &Arc<Self>,
        ref_inner: &Arc<RefInner>,
        discovered: Discovery,
    ) -> RepoResolution {
        let mut ref_state = ref_inner.state.lock();
        if ref_state.unreffed {
            return Err(RepoError::Unreffed);
        }
        let Some(root) = discovered.info.repo_root().cloned() else {
            return Err(RepoError::Discovery(
                "discovery succeeded without a repo root".to_owned(),
            ));
        };

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&root) {
            entry.refcount += 1;
            ref_state.cache = Some(Arc::clone(self));
            ref_state.bound_root = Some(root);
            return Ok(Arc::clone(&entry.repo));
        }
        match Repository::new(discovered, self.poller_config.clone()) {
            Ok(repo) => {
                entries.insert(
                    root.clone(),
                    CacheEntry {
                        repo: Arc::clone(&repo),
                        refcount: 1,
                    },
                );
                ref_state.cache = Some(Arc::clone(self));
                ref_state.bound_root = Some(root);
                Ok(repo)
            }
            Err(e) => Err(RepoError::Discovery(e.to_string())),
        }
    }

    fn release(&self, root: &Path) {
        let disposed = {
            let mut entries = self.entries.lock();
            match entries.get_mut(root) {
                Some(entry) => {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        entries.remove(root)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = disposed {
            entry.repo.dispose();
        }
    }
}

#[derive(Default)]
struct RefState {
    unreffed: bool,
    cache: Option<Arc<CacheInner>>,
    bound_root: Option<PathBuf>,
}

struct RefInner {
    resolution: watch::Receiver<Option<RepoResolution>>,
    state: Mutex<RefState>,
}

/// Caller-visible handle to a (possibly still resolving) repository.
///
/// `unref` counts once no matter how often it is called; dropping the
/// handle unrefs implicitly.
pub struct RepositoryReference {
    inner: Arc<RefInner>,
}

impl std::fmt::Debug for RepositoryReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryReference").finish()
    }
}

impl RepositoryReference {
    fn pending(rx: watch::Receiver<Option<RepoResolution>>) -> Self {
        Self {
            inner: Arc::new(RefInner {
                resolution: rx,
                state: Mutex::new(RefState::default()),
            }),
        }
    }

    fn resolved(
        cache: Arc<CacheInner>,
        root: PathBuf,
        repo: Arc<Repository>,
    ) -> Self {
        // The sender drops immediately; receivers still read the stored
        // value.
        let (_tx, rx) = watch::channel(Some(Ok(repo)));
        Self {
            inner: Arc::new(RefInner {
                resolution: rx,
                state: Mutex::new(RefState {
                    unreffed: false,
                    cache: Some(cache),
                    bound_root: Some(root),
                }),
            }),
        }
    }

    /// Wait for discovery and return the repository or the failure.
    pub async fn repository(&self) -> RepoResolution {
        self.wait().await
    }

    /// A detached future for the resolution, usable after the handle moved
    /// elsewhere.
    pub fn wait(
        &self,
    ) -> impl std::future::Future<Output = RepoResolution> + Send + 'static
    {
        let mut rx = self.inner.resolution.clone();
        async move {
            match rx.wait_for(|v| v.is_some()).await {
                Ok(guard) => {
                    guard.clone().unwrap_or(Err(RepoError::Unreffed))
                }
                Err(_) => Err(RepoError::Discovery(
                    "discovery task dropped its result".to_owned(),
                )),
            }
        }
    }

    /// Release this handle. Safe to call more than once; only the first
    /// call decrements. Before discovery resolves, this marks the handle so
    /// no repository is ever instantiated for it.
    pub fn unref(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            if state.unreffed {
                None
            } else {
                state.unreffed = true;
                state
                    .cache
                    .take()
                    .zip(state.bound_root.take())
            }
        };
        if let Some((cache, root)) = released {
            cache.release(&root);
        }
    }
}

impl Drop for RepositoryReference {
    fn drop(&mut self) {
        self.unref();
    }
}

fn longest_prefix_root<V>(
    entries: &HashMap<PathBuf, V>,
    path: &Path,
) -> Option<PathBuf> {
    entries
        .keys()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .cloned()
}
