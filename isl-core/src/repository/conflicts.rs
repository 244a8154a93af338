//! Merge-conflict detection and the resolved-path-preserving state machine.
//!
//! The tool's `resolve --tool internal:dumpjson --all` output drives the
//! transitions; see [`advance_files`] for the preservation rule.

use std::collections::HashSet;

use isl_model::{ConflictFile, ConflictStatus};
use serde::Deserialize;

use crate::error::Result;

/// Relevant slice of the dumpjson payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveDump {
    /// The interrupted command; `None` means no merge is active.
    pub command: Option<String>,
    pub command_details: Option<CommandDetails>,
    #[serde(default)]
    pub conflicts: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandDetails {
    pub cmd: String,
    pub to_continue: String,
    pub to_abort: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictEntry {
    pub path: String,
}

/// Parse dumpjson output; the payload is a one-element array.
pub fn parse_resolve_output(stdout: &str) -> Result<Option<ResolveDump>> {
    let mut dumps: Vec<ResolveDump> = serde_json::from_str(stdout)?;
    Ok(if dumps.is_empty() {
        None
    } else {
        Some(dumps.swap_remove(0))
    })
}

/// Compute the next `files` list from the previous one and the paths the
/// tool currently reports as conflicted.
///
/// Previous entries keep their order and are never dropped: a path missing
/// from `current` flips to `Resolved`, and one that reappears flips back to
/// unresolved. Newly conflicted paths append in the tool's order.
pub fn advance_files(
    previous: &[ConflictFile],
    current: &[String],
) -> Vec<ConflictFile> {
    let current_set: HashSet<&str> =
        current.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut files: Vec<ConflictFile> = previous
        .iter()
        .map(|f| {
            seen.insert(f.path.as_str());
            ConflictFile {
                path: f.path.clone(),
                status: if current_set.contains(f.path.as_str()) {
                    ConflictStatus::Unresolved
                } else {
                    ConflictStatus::Resolved
                },
            }
        })
        .collect();
    for path in current {
        if !seen.contains(path.as_str()) {
            files.push(ConflictFile {
                path: path.clone(),
                status: ConflictStatus::Unresolved,
            });
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolved(path: &str) -> ConflictFile {
        ConflictFile {
            path: path.to_owned(),
            status: ConflictStatus::Unresolved,
        }
    }

    #[test]
    fn resolved_paths_are_preserved_in_order() {
        let previous = vec![unresolved("a"), unresolved("b")];
        let files = advance_files(&previous, &["b".to_owned()]);
        assert_eq!(
            files,
            vec![
                ConflictFile {
                    path: "a".to_owned(),
                    status: ConflictStatus::Resolved
                },
                unresolved("b"),
            ]
        );
    }

    #[test]
    fn new_conflicts_append() {
        let previous = vec![unresolved("a")];
        let files =
            advance_files(&previous, &["a".to_owned(), "c".to_owned()]);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], unresolved("c"));
    }

    #[test]
    fn reappearing_path_flips_back_to_unresolved() {
        let previous = vec![ConflictFile {
            path: "a".to_owned(),
            status: ConflictStatus::Resolved,
        }];
        let files = advance_files(&previous, &["a".to_owned()]);
        assert_eq!(files, vec![unresolved("a")]);
    }

    #[test]
    fn parses_dumpjson_payload() {
        let stdout = r#"[{
            "command": "rebase",
            "command_details": {
                "cmd": "rebase",
                "to_continue": "rebase --continue",
                "to_abort": "rebase --abort"
            },
            "conflicts": [
                {"path": "src/a.rs", "base": {}, "local": {}, "other": {}},
                {"path": "src/b.rs"}
            ]
        }]"#;
        let dump = parse_resolve_output(stdout).unwrap().unwrap();
        assert_eq!(dump.command.as_deref(), Some("rebase"));
        assert_eq!(dump.conflicts.len(), 2);
        assert_eq!(dump.conflicts[0].path, "src/a.rs");
    }

    #[test]
    fn no_active_command_parses_as_none() {
        let dump = parse_resolve_output(r#"[{"command": null, "conflicts": []}]"#)
            .unwrap()
            .unwrap();
        assert!(dump.command.is_none());
        assert!(parse_resolve_output("[]").unwrap().is_none());
    }
}
