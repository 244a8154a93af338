//! Persistence of per-port server records in a per-user cache directory.
//!
//! The directory and its files hold shared secrets, so permissions are
//! enforced on every access: owner-only directory (0o700), owner-only files
//! (0o600), and a symlinked directory is treated as hostile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use isl_model::ServerRecord;
use rand::RngCore;
use tracing::debug;

use crate::error::{IslError, Result};

const STATE_DIR_NAME: &str = "sapling-isl";
const RECORD_PREFIX: &str = "reusable_server_";

pub const READ_RETRY_ATTEMPTS: u32 = 3;
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Resolve the per-user cache directory for server records.
///
/// Windows: `%LOCALAPPDATA%/cache/sapling-isl`; macOS:
/// `~/Library/Caches/sapling-isl`; elsewhere `$XDG_CACHE_HOME/sapling-isl`
/// with a `~/.cache` fallback.
pub fn state_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let base = std::env::var_os("LOCALAPPDATA").ok_or_else(|| {
            IslError::Internal("LOCALAPPDATA is not set".to_owned())
        })?;
        return Ok(PathBuf::from(base).join("cache").join(STATE_DIR_NAME));
    }
    let home = std::env::var_os("HOME").ok_or_else(|| {
        IslError::Internal("HOME is not set".to_owned())
    })?;
    if cfg!(target_os = "macos") {
        return Ok(PathBuf::from(home)
            .join("Library")
            .join("Caches")
            .join(STATE_DIR_NAME));
    }
    let cache_base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| PathBuf::from(home).join(".cache"));
    Ok(cache_base.join(STATE_DIR_NAME))
}

/// Store for `ServerRecord`s, one JSON file per port.
#[derive(Debug, Clone)]
pub struct ServerDir {
    root: PathBuf,
}

impl ServerDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Open the default per-user store.
    pub fn user_default() -> Result<Self> {
        Ok(Self::new(state_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, port: u16) -> PathBuf {
        self.root.join(format!("{RECORD_PREFIX}{port}"))
    }

    /// Create the folder with owner-only permissions, or verify an existing
    /// one. A symlink or group/other-accessible directory is fatal.
    ///
    /// Idempotent: calling twice is observably the same as calling once.
    pub async fn ensure_folder(&self) -> Result<()> {
        match tokio::fs::symlink_metadata(&self.root).await {
            Ok(meta) => {
                if meta.file_type().is_symlink() || !meta.is_dir() {
                    return Err(IslError::InsecureStateDir(self.root.clone()));
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if meta.permissions().mode() & 0o077 != 0 {
                        return Err(IslError::InsecureStateDir(
                            self.root.clone(),
                        ));
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.root).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(
                        &self.root,
                        std::fs::Permissions::from_mode(0o700),
                    )
                    .await?;
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write the record for `port` with owner-only permissions.
    pub async fn write(&self, port: u16, record: &ServerRecord) -> Result<()> {
        self.ensure_folder().await?;
        let json = serde_json::to_vec_pretty(record)?;
        let path = self.record_path(port);
        let root = self.root.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            use std::io::Write;
            tmp.write_all(&json)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(std::fs::Permissions::from_mode(0o600))?;
            }
            tmp.persist(&path)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| IslError::Internal(e.to_string()))?;
        written?;
        debug!(port, "wrote server record");
        Ok(())
    }

    pub async fn read(&self, port: u16) -> Result<ServerRecord> {
        let path = self.record_path(port);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IslError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read with retries, to mask the narrow race between a server binding
    /// its port and writing its record.
    pub async fn read_with_retries(&self, port: u16) -> Result<ServerRecord> {
        let mut last = None;
        for attempt in 0..READ_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
            match self.read(port).await {
                Ok(record) => return Ok(record),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            IslError::NotFound(format!("port {port}"))
        }))
    }

    /// Idempotent removal of the record for `port`.
    pub async fn delete(&self, port: u16) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(port)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Constant-time token equality over raw bytes.
///
/// Unequal lengths return false without comparing further; equal lengths
/// always scan every byte so execution time is independent of the position
/// of the first difference.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Generate a 128-bit hex-encoded secret (32 chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServerRecord {
        ServerRecord {
            sensitive_token: generate_token(),
            challenge_token: generate_token(),
            log_file_location: "stdout".to_owned(),
            command: "sl".to_owned(),
            tool_version: "0.2".to_owned(),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ServerDir::new(tmp.path().join("state"));
        let rec = record();
        dir.write(3011, &rec).await.unwrap();
        assert_eq!(dir.read(3011).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn ensure_folder_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ServerDir::new(tmp.path().join("state"));
        dir.ensure_folder().await.unwrap();
        dir.ensure_folder().await.unwrap();
        assert!(dir.root().is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loose_permissions_are_fatal() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("state");
        std::fs::create_dir(&root).unwrap();
        std::fs::set_permissions(
            &root,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        let dir = ServerDir::new(root);
        assert!(matches!(
            dir.ensure_folder().await,
            Err(IslError::InsecureStateDir(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_dir_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("state");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let dir = ServerDir::new(link);
        assert!(matches!(
            dir.ensure_folder().await,
            Err(IslError::InsecureStateDir(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ServerDir::new(tmp.path().join("state"));
        dir.write(4000, &record()).await.unwrap();
        dir.delete(4000).await.unwrap();
        dir.delete(4000).await.unwrap();
        assert!(matches!(
            dir.read(4000).await,
            Err(IslError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ServerDir::new(tmp.path().join("state"));
        dir.ensure_folder().await.unwrap();
        assert!(matches!(
            dir.read(9999).await,
            Err(IslError::NotFound(_))
        ));
    }

    #[test]
    fn token_compare_rejects_unequal_lengths() {
        assert!(!tokens_equal("abc", "abcd"));
        assert!(tokens_equal("abcd", "abcd"));
        assert!(!tokens_equal("abcd", "abce"));
    }

    #[test]
    fn generated_tokens_are_32_hex_chars() {
        let t = generate_token();
        assert_eq!(t.len(), 32);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(t, generate_token());
    }
}
