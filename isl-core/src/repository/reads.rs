//! One-shot read commands: thin wrappers over the subprocess runner, with
//! the large parallelizable ones capped by the shared read limiter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use isl_model::{
    ChangedFile, CommitCloudState, CommitInfo, Comparison, GeneratedStatus,
    ShelvedChange,
};
use serde::Deserialize;
use tracing::debug;

use super::{parse_status_output, smartlog, Repository};
use crate::error::{IslError, Result};

/// How much of a file's head is scanned for generation markers.
const GENERATED_SCAN_BYTES: usize = 4096;

/// Config sections clients may read and write.
const CONFIG_PREFIX: &str = "isl.";

#[derive(Deserialize)]
struct ShelveEntry {
    name: String,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    date: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

impl Repository {
    /// File contents at a revision. Limited by the shared read cap since
    /// the UI fires these in bursts when rendering comparisons.
    pub async fn cat(&self, path: &str, rev: &str) -> Result<String> {
        let _permit = self.read_limiter().acquire().await.map_err(|_| {
            IslError::Internal("read limiter closed".to_owned())
        })?;
        let out = self
            .run_tool(&["cat", path, "--rev", rev])
            .await?
            .into_result()?;
        Ok(out.stdout)
    }

    pub async fn blame(&self, path: &str) -> Result<String> {
        let _permit = self.read_limiter().acquire().await.map_err(|_| {
            IslError::Internal("read limiter closed".to_owned())
        })?;
        let out = self.run_tool(&["blame", path]).await?.into_result()?;
        Ok(out.stdout)
    }

    pub async fn fetch_shelved_changes(&self) -> Result<Vec<ShelvedChange>> {
        let out = self
            .run_tool(&["shelve", "--list", "-Tjson"])
            .await?
            .into_result()?;
        parse_shelve_output(&out.stdout)
    }

    /// Latest commit matching `revset`, via the smartlog template.
    pub async fn fetch_latest_commit(&self, revset: &str) -> Result<CommitInfo> {
        let template = smartlog::commit_template();
        let out = self
            .run_tool(&[
                "log",
                "--limit",
                "1",
                "--template",
                &template,
                "--rev",
                revset,
            ])
            .await?
            .into_result()?;
        let mut commits = smartlog::parse_smartlog_output(&out.stdout)?;
        Ok(commits.swap_remove(0))
    }

    /// Every file changed by `hash`, not just the sampled subset.
    pub async fn fetch_all_commit_changed_files(
        &self,
        hash: &str,
    ) -> Result<Vec<ChangedFile>> {
        let out = self
            .run_tool(&["status", "--change", hash, "-Tjson"])
            .await?
            .into_result()?;
        parse_status_output(&out.stdout)
    }

    pub async fn fetch_commit_cloud_state(&self) -> Result<CommitCloudState> {
        let out = self.run_tool(&["cloud", "status"]).await?.into_result()?;
        Ok(parse_cloud_status(&out.stdout))
    }

    /// Raw diff text for one of the UI's comparison views.
    pub async fn comparison_diff(
        &self,
        comparison: &Comparison,
    ) -> Result<String> {
        let args: Vec<&str> = match comparison {
            Comparison::UncommittedChanges => vec!["diff"],
            Comparison::HeadChanges => vec!["diff", "--rev", ".^"],
            Comparison::StackChanges => {
                vec!["diff", "--rev", "ancestor(.,public())"]
            }
            Comparison::Committed { hash } => vec!["diff", "--change", hash],
        };
        let out = self.run_tool(&args).await?.into_result()?;
        Ok(out.stdout)
    }

    /// A window of the working-copy file, for expanding diff context.
    /// `start` is 1-based.
    pub async fn comparison_context_lines(
        &self,
        path: &str,
        start: u64,
        num_lines: u64,
    ) -> Result<Vec<String>> {
        let abs = self.repo_root().join(path);
        let contents = tokio::fs::read_to_string(&abs).await?;
        let start = (start.saturating_sub(1)) as usize;
        Ok(contents
            .lines()
            .skip(start)
            .take(num_lines as usize)
            .map(str::to_owned)
            .collect())
    }

    /// Scan file heads for generation markers, bounded by the read limiter.
    pub async fn fetch_generated_statuses(
        &self,
        paths: &[String],
    ) -> HashMap<String, GeneratedStatus> {
        let mut tasks = Vec::with_capacity(paths.len());
        for path in paths {
            let abs = self.repo_root().join(path);
            let limiter = self.read_limiter().clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = limiter.acquire().await else {
                    return (path, GeneratedStatus::Manual);
                };
                (path, scan_generated_status(&abs).await)
            }));
        }
        let mut results = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if let Ok((path, status)) = task.await {
                results.insert(path, status);
            }
        }
        results
    }

    pub async fn export_stack(&self, revs: &str) -> Result<serde_json::Value> {
        let out = self
            .run_tool(&["debugexportstack", "-r", revs])
            .await?
            .into_result()?;
        Ok(serde_json::from_str(&out.stdout)?)
    }

    pub async fn import_stack(
        &self,
        stack: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let stdin = serde_json::to_vec(stack)?;
        let out = self
            .run_tool_with_stdin(&["debugimportstack"], stdin)
            .await?
            .into_result()?;
        Ok(serde_json::from_str(&out.stdout)
            .unwrap_or(serde_json::Value::Null))
    }

    /// Read a client-accessible config value; `None` when unset.
    pub async fn get_config(&self, name: &str) -> Result<Option<String>> {
        ensure_client_config(name)?;
        let out = self.run_tool(&["config", name]).await?;
        if !out.success() {
            return Ok(None);
        }
        let value = out.stdout.trim();
        Ok(if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        })
    }

    pub async fn set_config(&self, name: &str, value: &str) -> Result<()> {
        ensure_client_config(name)?;
        self.run_tool(&["config", "--user", name, value])
            .await?
            .into_result()?;
        Ok(())
    }

    /// Diff summaries come from the attached review provider, if any.
    pub async fn fetch_diff_summaries(&self) -> Result<serde_json::Value> {
        match self.code_review_provider() {
            Some(provider) => {
                debug!(provider = provider.name(), "fetching diff summaries");
                provider.fetch_diff_summaries().await
            }
            None => Err(IslError::Internal(
                "no code review provider attached".to_owned(),
            )),
        }
    }
}

fn ensure_client_config(name: &str) -> Result<()> {
    if name.starts_with(CONFIG_PREFIX) {
        Ok(())
    } else {
        Err(IslError::OperationRejected(format!(
            "config '{name}' is not client-accessible"
        )))
    }
}

fn parse_shelve_output(stdout: &str) -> Result<Vec<ShelvedChange>> {
    let entries: Vec<ShelveEntry> = serde_json::from_str(stdout)?;
    Ok(entries
        .into_iter()
        .map(|e| ShelvedChange {
            hash: e.node.unwrap_or_default(),
            date: parse_shelve_date(e.date.as_ref()),
            description: e.description.unwrap_or_default(),
            name: e.name,
        })
        .collect())
}

/// Shelve dates appear either as a unix number or a `[seconds, offset]`
/// pair depending on tool version.
fn parse_shelve_date(value: Option<&serde_json::Value>) -> DateTime<Utc> {
    let seconds = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::Array(parts)) => parts
            .first()
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
        _ => 0.0,
    };
    DateTime::<Utc>::from_timestamp(seconds as i64, 0)
        .unwrap_or_else(Utc::now)
}

fn parse_cloud_status(stdout: &str) -> CommitCloudState {
    let mut state = CommitCloudState {
        workspace: None,
        last_sync: None,
        sync_error: None,
    };
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Workspace:") {
            state.workspace = Some(value.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("Last Sync Time:") {
            state.last_sync = value
                .trim()
                .parse::<DateTime<Utc>>()
                .ok()
                .or(state.last_sync);
        } else if line.to_ascii_lowercase().contains("error") {
            state.sync_error = Some(line.to_owned());
        }
    }
    state
}

async fn scan_generated_status(
    path: &std::path::Path,
) -> GeneratedStatus {
    // Built at runtime so this source file never carries the markers
    // themselves.
    let generated_marker = format!("@{}", "generated");
    let partial_marker = format!("@partially-{}", "generated");
    let head = match tokio::fs::read(path).await {
        Ok(bytes) => {
            let len = bytes.len().min(GENERATED_SCAN_BYTES);
            String::from_utf8_lossy(&bytes[..len]).into_owned()
        }
        Err(_) => return GeneratedStatus::Manual,
    };
    if head.contains(&partial_marker) {
        GeneratedStatus::PartiallyGenerated
    } else if head.contains(&generated_marker) {
        GeneratedStatus::Generated
    } else {
        GeneratedStatus::Manual
    }
}
