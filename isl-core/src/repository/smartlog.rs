//! Smartlog fetch: the log template, its record parser, and the revset
//! range cursor.
//!
//! Each record is a fixed sequence of single-line fields followed by the
//! full description, which is the only field allowed to contain newlines;
//! records are separated by a sentinel line.

use chrono::{DateTime, Utc};
use isl_model::{
    ChangedFile, CommitInfo, CommitPhase, FileStatus, SuccessorInfo,
};

use crate::error::{IslError, Result};

pub const COMMIT_END_MARK: &str = "<<COMMIT_END_MARK>>";

/// Fixed lines preceding the description in each record.
const FIXED_FIELDS: usize = 13;

/// How many changed files to sample per commit.
const MAX_FILES_SAMPLE: usize = 25;

/// Days of history per widening step; `None` means unlimited.
pub const VISIBLE_COMMIT_RANGES: [Option<u32>; 3] = [Some(14), Some(60), None];

/// Log template matching [`parse_commit`]. File lists use the json filter so
/// arbitrary filenames survive the line-oriented layout.
pub fn commit_template() -> String {
    [
        "{node}",
        "{desc|firstline}",
        "{author}",
        "{date|hgdate}",
        "{phase}",
        "{bookmarks % '{bookmark},'}",
        "{remotenames % '{remotename},'}",
        "{parents % '{node},'}",
        "{ifcontains(rev, revset('.'), '1', '0')}",
        "{file_adds|json}",
        "{file_mods|json}",
        "{file_dels|json}",
        "{mutations % '{operation}:{join(successors, \" \")};'}",
        "{desc}",
    ]
    .join("\n")
        + &format!("\n{COMMIT_END_MARK}\n")
}

/// Revset selecting the smartlog, optionally limited to recent history.
pub fn smartlog_revset(days: Option<u32>) -> String {
    match days {
        Some(days) => format!(
            "smartlog(((interestingbookmarks() + heads(draft())) & date(-{days})) + .)"
        ),
        None => "smartlog()".to_owned(),
    }
}

/// Split templated log output into commits. An empty result is an error so
/// callers never mistake a broken template for an empty repo.
pub fn parse_smartlog_output(stdout: &str) -> Result<Vec<CommitInfo>> {
    let mut commits = Vec::new();
    for record in stdout.split(COMMIT_END_MARK) {
        let record = record.strip_prefix('\n').unwrap_or(record);
        if record.trim().is_empty() {
            continue;
        }
        commits.push(parse_commit(record)?);
    }
    if commits.is_empty() {
        return Err(IslError::NoCommitsFetched);
    }
    Ok(commits)
}

fn parse_commit(record: &str) -> Result<CommitInfo> {
    let parts: Vec<&str> = record.splitn(FIXED_FIELDS + 1, '\n').collect();
    if parts.len() < FIXED_FIELDS + 1 {
        return Err(IslError::Internal(format!(
            "malformed commit record ({} of {} fields)",
            parts.len(),
            FIXED_FIELDS + 1
        )));
    }

    let hash = parts[0].to_owned();
    let title = parts[1].to_owned();
    let author = parts[2].to_owned();
    let date = parse_hgdate(parts[3])?;
    let phase = match parts[4] {
        "public" => CommitPhase::Public,
        _ => CommitPhase::Draft,
    };
    let bookmarks = split_list(parts[5]);
    let remote_bookmarks = split_list(parts[6]);
    let parents = split_list(parts[7]);
    let is_dot = parts[8] == "1";

    let added: Vec<String> = parse_json_list(parts[9]);
    let modified: Vec<String> = parse_json_list(parts[10]);
    let removed: Vec<String> = parse_json_list(parts[11]);
    let total_file_count =
        (added.len() + modified.len() + removed.len()) as u64;
    let files_sample = added
        .into_iter()
        .map(|path| ChangedFile {
            path,
            status: FileStatus::Added,
        })
        .chain(modified.into_iter().map(|path| ChangedFile {
            path,
            status: FileStatus::Modified,
        }))
        .chain(removed.into_iter().map(|path| ChangedFile {
            path,
            status: FileStatus::Removed,
        }))
        .take(MAX_FILES_SAMPLE)
        .collect();

    let successor_info = parse_first_successor(parts[12]);
    // Trailing newline before the sentinel belongs to the template, not the
    // description.
    let description = parts[13]
        .strip_suffix('\n')
        .unwrap_or(parts[13])
        .to_owned();

    Ok(CommitInfo {
        hash,
        title,
        author,
        date,
        parents,
        phase,
        bookmarks,
        remote_bookmarks,
        is_dot,
        successor_info,
        total_file_count,
        files_sample,
        description,
    })
}

/// `{date|hgdate}` prints `<unix seconds> <tz offset>`.
fn parse_hgdate(field: &str) -> Result<DateTime<Utc>> {
    let seconds = field
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            IslError::Internal(format!("bad date field: {field:?}"))
        })?;
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
        IslError::Internal(format!("date out of range: {seconds}"))
    })
}

/// Comma-joined template lists end with a trailing separator.
fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_json_list(field: &str) -> Vec<String> {
    serde_json::from_str(field).unwrap_or_default()
}

/// Only the first successor of the first mutation entry is surfaced.
fn parse_first_successor(field: &str) -> Option<SuccessorInfo> {
    let entry = field.split(';').find(|s| !s.trim().is_empty())?;
    let (operation, hashes) = entry.split_once(':')?;
    let first = hashes.split_whitespace().next()?;
    Some(SuccessorInfo {
        hash: first.to_owned(),
        kind: operation.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(desc: &str, mutations: &str) -> String {
        format!(
            "abc123\nFix the bug\nTest User <test@example.com>\n1700000000 0\ndraft\nmain,\nremote/main,\ndef456,\n1\n[\"new.rs\"]\n[\"src/lib.rs\", \"src/main.rs\"]\n[]\n{mutations}\n{desc}\n"
        )
    }

    #[test]
    fn parses_a_full_record() {
        let stdout = format!(
            "{}{}\n",
            record("Fix the bug\n\nLonger body here.", ""),
            COMMIT_END_MARK
        );
        let commits = parse_smartlog_output(&stdout).unwrap();
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.hash, "abc123");
        assert_eq!(c.title, "Fix the bug");
        assert_eq!(c.parents, vec!["def456"]);
        assert_eq!(c.bookmarks, vec!["main"]);
        assert_eq!(c.remote_bookmarks, vec!["remote/main"]);
        assert!(c.is_dot);
        assert_eq!(c.phase, CommitPhase::Draft);
        assert_eq!(c.total_file_count, 3);
        assert_eq!(c.files_sample[0].status, FileStatus::Added);
        assert_eq!(c.description, "Fix the bug\n\nLonger body here.");
        assert!(c.successor_info.is_none());
    }

    #[test]
    fn description_may_contain_newlines() {
        let desc = "Title line\n\nParagraph with\nmany\nlines";
        let stdout = format!("{}{}\n", record(desc, ""), COMMIT_END_MARK);
        let commits = parse_smartlog_output(&stdout).unwrap();
        assert_eq!(commits[0].description, desc);
    }

    #[test]
    fn only_first_successor_is_kept() {
        let stdout = format!(
            "{}{}\n",
            record("x", "amend:aaa bbb;rebase:ccc;"),
            COMMIT_END_MARK
        );
        let commits = parse_smartlog_output(&stdout).unwrap();
        let succ = commits[0].successor_info.as_ref().unwrap();
        assert_eq!(succ.hash, "aaa");
        assert_eq!(succ.kind, "amend");
    }

    #[test]
    fn empty_output_is_no_commits_fetched() {
        assert!(matches!(
            parse_smartlog_output(""),
            Err(IslError::NoCommitsFetched)
        ));
    }

    #[test]
    fn multiple_records_split_on_sentinel() {
        let stdout = format!(
            "{}{}\n{}{}\n",
            record("first", ""),
            COMMIT_END_MARK,
            record("second", ""),
            COMMIT_END_MARK
        );
        let commits = parse_smartlog_output(&stdout).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[1].description, "second");
    }

    #[test]
    fn revset_widens_with_range() {
        assert!(smartlog_revset(Some(14)).contains("date(-14)"));
        assert_eq!(smartlog_revset(None), "smartlog()");
    }
}
