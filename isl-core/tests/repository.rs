//! End-to-end repository behavior against a scripted fake source-control
//! tool. The script serves canned responses from files next to itself, so
//! tests can swap outputs between checks.
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use isl_core::repository::{Discovery, RepoSettings, Repository};
use isl_core::watch::PollerConfig;
use isl_model::{
    CodeReviewSystem, ConflictStatus, MergeConflicts, RepoInfo,
};

struct Fixture {
    _tmp: tempfile::TempDir,
    tool_dir: PathBuf,
    repo_root: PathBuf,
    command: String,
}

impl Fixture {
    fn new() -> Self {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let tool_dir = tmp.path().join("tool");
        let repo_root = tmp.path().join("repo");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::create_dir_all(repo_root.join(".sl")).unwrap();

        let script = tool_dir.join("fake-sl");
        let body = format!(
            r#"#!/bin/sh
dir="{tool}"
case "$1" in
  root) if [ "$2" = "--dotdir" ]; then echo '{root}/.sl'; else echo '{root}'; fi ;;
  config) exit 1 ;;
  status) cat "$dir/status.json" ;;
  log) cat "$dir/log.out" 2>/dev/null ;;
  resolve) cat "$dir/resolve.json" ;;
  cat) printf 'contents of %s at %s' "$2" "$4" ;;
  blame) printf 'author: line one of %s' "$2" ;;
  *) ;;
esac
"#,
            tool = tool_dir.display(),
            root = repo_root.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(
            &script,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let fx = Self {
            command: script.display().to_string(),
            tool_dir,
            repo_root,
            _tmp: tmp,
        };
        fx.set_status("[]");
        fx
    }

    fn set_status(&self, json: &str) {
        std::fs::write(self.tool_dir.join("status.json"), json).unwrap();
    }

    fn set_resolve(&self, json: &str) {
        std::fs::write(self.tool_dir.join("resolve.json"), json).unwrap();
    }

    fn begin_merge(&self) {
        std::fs::create_dir_all(self.repo_root.join(".sl/merge")).unwrap();
    }

    fn repository(&self) -> Arc<Repository> {
        let discovery = Discovery {
            info: RepoInfo::Success {
                command: self.command.clone(),
                repo_root: self.repo_root.clone(),
                dotdir: self.repo_root.join(".sl"),
                code_review_system: CodeReviewSystem::None,
                pull_request_domain: None,
                preferred_submit_command: None,
            },
            settings: RepoSettings::default(),
        };
        Repository::new(discovery, PollerConfig::default()).unwrap()
    }
}

fn resolve_json(conflicts: &[&str]) -> String {
    let entries: Vec<String> = conflicts
        .iter()
        .map(|p| format!(r#"{{"path": "{p}"}}"#))
        .collect();
    format!(
        r#"[{{
            "command": "rebase",
            "command_details": {{
                "cmd": "rebase",
                "to_continue": "rebase --continue",
                "to_abort": "rebase --abort"
            }},
            "conflicts": [{conflicts}]
        }}]"#,
        conflicts = entries.join(",")
    )
}

async fn next_loaded(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Option<MergeConflicts>>,
) -> MergeConflicts {
    loop {
        let state = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for conflicts")
            .expect("conflicts channel closed");
        if let Some(conflicts @ MergeConflicts::Loaded { .. }) = state {
            return conflicts;
        }
    }
}

fn statuses(conflicts: &MergeConflicts) -> Vec<(String, ConflictStatus)> {
    conflicts
        .files()
        .iter()
        .map(|f| (f.path.clone(), f.status))
        .collect()
}

#[tokio::test]
async fn conflict_lifecycle_preserves_resolved_paths() {
    let fx = Fixture::new();
    let repo = fx.repository();
    // Let the initial background refresh settle so its conflict check (a
    // no-op while no merge dir exists) cannot interleave with ours.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut rx = repo.subscribe_merge_conflicts();

    // Initially no merge: current state pushed on subscribe is None.
    assert_eq!(rx.recv().await, Some(None));

    // No merge dir yet: a check is a no-op.
    repo.check_conflicts().await;

    fx.begin_merge();
    fx.set_resolve(&resolve_json(&["a.txt", "b.txt"]));
    repo.check_conflicts().await;

    // Loading precedes the first loaded snapshot.
    assert_eq!(rx.recv().await, Some(Some(MergeConflicts::Loading)));
    let loaded = next_loaded(&mut rx).await;
    assert_eq!(
        statuses(&loaded),
        vec![
            ("a.txt".to_owned(), ConflictStatus::Unresolved),
            ("b.txt".to_owned(), ConflictStatus::Unresolved),
        ]
    );

    // One file resolved: it stays listed, flipped to Resolved.
    fx.set_resolve(&resolve_json(&["b.txt"]));
    repo.check_conflicts().await;
    let loaded = next_loaded(&mut rx).await;
    assert_eq!(
        statuses(&loaded),
        vec![
            ("a.txt".to_owned(), ConflictStatus::Resolved),
            ("b.txt".to_owned(), ConflictStatus::Unresolved),
        ]
    );

    // Merge finished: state returns to None.
    fx.set_resolve(r#"[{"command": null, "conflicts": []}]"#);
    repo.check_conflicts().await;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for merge end")
        {
            Some(None) => break,
            Some(Some(_)) => continue,
            None => panic!("conflicts channel closed"),
        }
    }
    assert_eq!(repo.merge_conflicts(), None);
    repo.dispose();
}

#[tokio::test]
async fn uncommitted_changes_flow_to_subscribers() {
    let fx = Fixture::new();
    fx.set_status(
        r#"[{"path": "src/lib.rs", "status": "M"}, {"path": "new.rs", "status": "A"}]"#,
    );
    let repo = fx.repository();
    let mut rx = repo.subscribe_uncommitted_changes();

    repo.fetch_uncommitted_changes().await;
    let changes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(changes.files.len(), 2);
    assert_eq!(changes.files[0].path, "src/lib.rs");
    assert!(changes.fetch_completed_at >= changes.fetch_started_at);
    repo.dispose();
}

#[tokio::test]
async fn smartlog_parses_scripted_log_output() {
    let fx = Fixture::new();
    let record = "aaa111\nInitial commit\nAda <ada@example.com>\n1700000000 0\ndraft\n\n\n\n1\n[]\n[\"src/lib.rs\"]\n[]\n\nInitial commit\n<<COMMIT_END_MARK>>\n";
    std::fs::write(fx.tool_dir.join("log.out"), record).unwrap();

    let repo = fx.repository();
    let mut rx = repo.subscribe_smartlog_commits();
    repo.fetch_smartlog_commits().await;

    let commits = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(commits.commits.len(), 1);
    let commit = &commits.commits[0];
    assert_eq!(commit.hash, "aaa111");
    assert!(commit.is_dot);
    assert_eq!(commit.total_file_count, 1);
    repo.dispose();
}

#[tokio::test]
async fn empty_smartlog_is_reported_as_error() {
    let fx = Fixture::new();
    std::fs::write(fx.tool_dir.join("log.out"), "").unwrap();

    let repo = fx.repository();
    let mut rx = repo.subscribe_smartlog_commits();
    repo.fetch_smartlog_commits().await;

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().contains("no commits"));
    repo.dispose();
}

#[tokio::test]
async fn generated_statuses_scan_repo_files(
) {
    let fx = Fixture::new();
    std::fs::write(
        fx.repo_root.join("machine.rs"),
        format!("// {}{}\n", "@gen", "erated"),
    )
    .unwrap();
    std::fs::write(fx.repo_root.join("hand.rs"), "fn main() {}").unwrap();

    let repo = fx.repository();
    let statuses = repo
        .fetch_generated_statuses(&[
            "machine.rs".to_owned(),
            "hand.rs".to_owned(),
        ])
        .await;
    assert_eq!(
        statuses.get("machine.rs"),
        Some(&isl_model::GeneratedStatus::Generated)
    );
    assert_eq!(
        statuses.get("hand.rs"),
        Some(&isl_model::GeneratedStatus::Manual)
    );
    repo.dispose();
}

#[tokio::test]
async fn context_lines_slice_working_copy_files() {
    let fx = Fixture::new();
    std::fs::write(fx.repo_root.join("file.txt"), "one\ntwo\nthree\nfour\n")
        .unwrap();
    let repo = fx.repository();
    let lines = repo
        .comparison_context_lines("file.txt", 2, 2)
        .await
        .unwrap();
    assert_eq!(lines, vec!["two", "three"]);
    repo.dispose();
}

#[tokio::test]
async fn cat_and_blame_run_under_the_read_limiter() {
    let fx = Fixture::new();
    let repo = fx.repository();

    // Far more than the limiter's permits; all must complete.
    let mut tasks = Vec::new();
    for i in 0..16 {
        let repo = repo.clone();
        tasks.push(tokio::spawn(async move {
            repo.cat(&format!("file{i}.txt"), "abc123").await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let contents = task.await.unwrap().unwrap();
        assert_eq!(
            contents,
            format!("contents of file{i}.txt at abc123")
        );
    }

    let annotated = repo.blame("src/lib.rs").await.unwrap();
    assert!(annotated.contains("line one of src/lib.rs"));
    repo.dispose();
}

// The fake tool ignores unknown subcommands with exit 0 and empty output,
// which exercises the lenient paths of the read wrappers.
#[tokio::test]
async fn cloud_status_tolerates_empty_output() {
    let fx = Fixture::new();
    let repo = fx.repository();
    let state = repo.fetch_commit_cloud_state().await.unwrap();
    assert!(state.workspace.is_none());
    repo.dispose();
}
