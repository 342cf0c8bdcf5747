//! VCS operation errors.

use std::path::PathBuf;

use crate::command::CommandError;
use crate::safety::SafetyError;

/// A VCS operation failed, or was refused outright.
#[derive(Debug, Clone)]
pub enum VcsError {
    NotARepository { path: PathBuf },
    BranchAlreadyExists { branch: String },
    BranchNotFound { branch: String },
    NothingToCommit,
    WorktreeAlreadyExists { path: PathBuf },
    WorktreeNotFound { branch: String },
    MergeConflict { files: Vec<PathBuf> },
    PushFailed { branch: String, error: String },
    /// A safety gate refused the operation before any command ran.
    Safety(SafetyError),
    /// Wraps an underlying command failure not covered by a sentinel above.
    Command {
        operation: &'static str,
        source: CommandError,
    },
}

impl VcsError {
    pub fn command(operation: &'static str, source: CommandError) -> Self {
        Self::Command { operation, source }
    }
}

impl std::fmt::Display for VcsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotARepository { path } => {
                write!(f, "{} is not a git repository", path.display())
            }
            Self::BranchAlreadyExists { branch } => {
                write!(f, "branch {branch:?} already exists")
            }
            Self::BranchNotFound { branch } => write!(f, "branch {branch:?} not found"),
            Self::NothingToCommit => write!(f, "nothing to commit"),
            Self::WorktreeAlreadyExists { path } => {
                write!(f, "worktree already exists at {}", path.display())
            }
            Self::WorktreeNotFound { branch } => {
                write!(f, "no worktree found for branch {branch:?}")
            }
            Self::MergeConflict { files } => {
                write!(f, "merge conflict in {} file(s): {:?}", files.len(), files)
            }
            Self::PushFailed { branch, error } => {
                write!(f, "push to {branch:?} failed: {error}")
            }
            Self::Safety(e) => write!(f, "{e}"),
            Self::Command { operation, source } => {
                write!(f, "git {operation} failed: {source}")
            }
        }
    }
}

impl std::error::Error for VcsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Command { source, .. } => Some(source),
            Self::Safety(e) => Some(e),
            _ => None,
        }
    }
}

/// Classify a raw command failure against the known sentinel situations for
/// a given operation, falling back to a generic wrapped command error.
///
/// `subject` is whatever identifies the target of the operation — a branch
/// name for branch/push/merge operations, a worktree path for `worktree
/// *` operations — and is threaded straight into the matching sentinel
/// variant.
pub(crate) fn classify(operation: &'static str, subject: Option<&str>, source: CommandError) -> VcsError {
    let msg = source.message.to_lowercase();

    if operation.starts_with("worktree") {
        if msg.contains("already exists") {
            return VcsError::WorktreeAlreadyExists {
                path: subject.map(PathBuf::from).unwrap_or_else(|| source.workdir.clone()),
            };
        }
        if msg.contains("is not a working tree") || msg.contains("not a working tree") {
            return VcsError::WorktreeNotFound {
                branch: subject.unwrap_or_default().to_string(),
            };
        }
    }

    if (operation == "merge" || operation == "rebase") && msg.contains("conflict") {
        // The conflicted file list is recovered separately (e.g.
        // `sync::rebase_with_conflict_check` re-reads `git status`); this
        // sentinel carries no file list of its own.
        return VcsError::MergeConflict { files: Vec::new() };
    }

    if matches!(operation, "push" | "push --force-with-lease")
        && (msg.contains("rejected") || msg.contains("failed to push") || msg.contains("non-fast-forward"))
    {
        return VcsError::PushFailed {
            branch: subject.unwrap_or_default().to_string(),
            error: source.message.clone(),
        };
    }

    if operation.starts_with("branch") && (msg.contains("not found") || msg.contains("not a valid object name")) {
        return VcsError::BranchNotFound {
            branch: subject.unwrap_or_default().to_string(),
        };
    }

    if msg.contains("already exists") {
        if let Some(subject) = subject {
            return VcsError::BranchAlreadyExists {
                branch: subject.to_string(),
            };
        }
    }
    if msg.contains("not a git repository") {
        return VcsError::NotARepository {
            path: source.workdir.clone(),
        };
    }
    if msg.contains("nothing to commit") {
        return VcsError::NothingToCommit;
    }
    VcsError::command(operation, source)
}
