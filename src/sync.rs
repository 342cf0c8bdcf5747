//! Rebase-with-conflict-detection and push-with-force-fallback.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::vcs::{VcsError, VcsHandle};

/// Result of a sync attempt (rebase or push) against another branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub synced: bool,
    pub conflicts_detected: bool,
    pub conflict_files: Vec<PathBuf>,
    pub commits_ahead: u32,
    pub commits_behind: u32,
}

static NON_FAST_FORWARD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)non-fast-forward",
        r"(?i)rejected.*fetch first",
        r"(?i)failed to push.*behind",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Does `message` match one of the known non-fast-forward failure
/// signatures git emits on push rejection?
pub fn is_non_fast_forward_error(message: &str) -> bool {
    NON_FAST_FORWARD_PATTERNS.iter().any(|re| re.is_match(message))
}

/// Rebase `handle`'s branch onto `onto`, detecting conflicts without
/// leaving a rebase in progress either way.
///
/// Tries a server-side merge-tree check first, which touches no
/// working-tree state; only if that's unavailable does it fall back to a
/// real `git rebase` and detect conflicts from its failure.
pub fn rebase_with_conflict_check(handle: &VcsHandle, onto: &str) -> Result<SyncResult, VcsError> {
    if let Some(conflict_files) = detect_conflicts_via_merge_tree(handle, onto)? {
        if !conflict_files.is_empty() {
            return Ok(SyncResult {
                synced: false,
                conflicts_detected: true,
                conflict_files,
                commits_ahead: 0,
                commits_behind: 0,
            });
        }
    }

    match handle.rebase(onto) {
        Ok(_) => {
            let (ahead, behind) = ahead_behind(handle, onto).unwrap_or((0, 0));
            Ok(SyncResult {
                synced: true,
                conflicts_detected: false,
                conflict_files: Vec::new(),
                commits_ahead: ahead,
                commits_behind: behind,
            })
        }
        Err(e) => {
            let message = e.to_string();
            if message.to_lowercase().contains("conflict") {
                let files = list_conflicted_files(handle).unwrap_or_default();
                let _ = handle.rebase_abort();
                Ok(SyncResult {
                    synced: false,
                    conflicts_detected: true,
                    conflict_files: files,
                    commits_ahead: 0,
                    commits_behind: 0,
                })
            } else {
                // Non-conflict failure (dirty tree, invalid ref, ...): never
                // leave a rebase in progress, but don't fabricate a conflict.
                let _ = handle.rebase_abort();
                Err(e)
            }
        }
    }
}

fn ahead_behind(handle: &VcsHandle, onto: &str) -> Result<(u32, u32), VcsError> {
    let ahead = handle.count_commits(onto, "HEAD")?;
    let behind = handle.count_commits("HEAD", onto)?;
    Ok((ahead, behind))
}

/// Pre-check for conflicts via `git merge-tree`, without touching the
/// working tree. Returns `None` if the command isn't supported by the
/// installed git (caller should fall back to a real rebase), `Some(files)`
/// otherwise (`files` empty means merge-tree predicts a clean rebase).
fn detect_conflicts_via_merge_tree(handle: &VcsHandle, onto: &str) -> Result<Option<Vec<PathBuf>>, VcsError> {
    let output = match run_merge_tree(handle, onto) {
        Ok(output) => output,
        Err(_) => return Ok(None),
    };
    Ok(Some(parse_merge_tree_conflicts(&output)))
}

fn run_merge_tree(handle: &VcsHandle, onto: &str) -> Result<String, VcsError> {
    handle.merge_tree(onto, "HEAD")
}

/// Parse classic `git merge-tree` output for conflicted file paths. Each
/// conflicted section lists `our`/`their`/`base` blob lines ending in a
/// path, followed by inline `<<<<<<<` conflict markers.
fn parse_merge_tree_conflicts(output: &str) -> Vec<PathBuf> {
    static BLOB_LINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\s+(?:base|our|their)\s+\S+\s+\S+\s+(.+)$").unwrap());

    let mut files = Vec::new();
    let mut current_paths: Vec<String> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = BLOB_LINE.captures(line) {
            let path = caps[1].to_string();
            if !current_paths.contains(&path) {
                current_paths.push(path);
            }
        } else if line.starts_with("<<<<<<<") {
            for p in current_paths.drain(..) {
                let p = PathBuf::from(p);
                if !files.contains(&p) {
                    files.push(p);
                }
            }
        }
    }
    files
}

fn list_conflicted_files(handle: &VcsHandle) -> Result<Vec<PathBuf>, VcsError> {
    let status = handle.status_short()?;
    Ok(status
        .lines()
        .filter(|l| l.starts_with("UU") || l.starts_with("AA") || l.starts_with("DD"))
        .filter_map(|l| l.get(3..).map(|p| PathBuf::from(p.trim())))
        .collect())
}

/// Push `branch`, falling back to `--force-with-lease` only when the
/// failure matches a known non-fast-forward signature. Any other failure
/// (network, auth, unknown host) surfaces unchanged with no retry. Both
/// the plain push and the fallback go through [`VcsHandle::push`]/
/// [`VcsHandle::force_push`], so both safety gates still apply to the
/// fallback.
pub fn push_with_force_fallback(
    handle: &VcsHandle,
    remote: &str,
    branch: &str,
    set_upstream: bool,
    on_warning: impl FnOnce(&str),
) -> Result<(), VcsError> {
    match handle.push(remote, branch, set_upstream) {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = e.to_string();
            if is_non_fast_forward_error(&message) {
                on_warning(&format!(
                    "push to {branch:?} was rejected as non-fast-forward ({message}); \
                     retrying with --force-with-lease"
                ));
                handle.force_push(remote, branch)
            } else {
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fast_forward_detection_scenarios() {
        assert!(is_non_fast_forward_error(
            "error: failed to push some refs - non-fast-forward update"
        ));
        assert!(!is_non_fast_forward_error("Could not resolve host: example.com"));
    }

    #[test]
    fn merge_tree_conflict_parsing_extracts_unique_paths() {
        let output = "\
  base   100644 aaa src/lib.rs
  our    100644 bbb src/lib.rs
  their  100644 ccc src/lib.rs
<<<<<<< .our
fn a() {}
=======
fn b() {}
>>>>>>> .their
";
        let files = parse_merge_tree_conflicts(output);
        assert_eq!(files, vec![PathBuf::from("src/lib.rs")]);
    }

    #[test]
    fn merge_tree_conflict_parsing_handles_no_conflicts() {
        assert!(parse_merge_tree_conflicts("  base   100644 aaa src/lib.rs\n").is_empty());
    }
}
