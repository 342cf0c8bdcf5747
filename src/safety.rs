//! The two safety gates.
//!
//! Every operation that can modify the *main* repository's working tree, or
//! push/reset a protected branch, is checked against these gates before any
//! subprocess is spawned. Both gates fail fast and in-process; hook scripts
//! installed by [`crate::hooks`] are defense in depth, not the primary
//! control.

use std::collections::HashSet;

/// A gate refused an operation before any VCS command was invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyError {
    /// The operation modifies the main repository's working tree but the
    /// handle wasn't obtained via `VcsContext::in_worktree`.
    MainRepoModification { operation: &'static str },
    /// The operation targets a protected branch.
    ProtectedBranch {
        branch: String,
        operation: &'static str,
    },
}

impl std::fmt::Display for SafetyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MainRepoModification { operation } => write!(
                f,
                "refusing to run {operation:?} against the main repository's working tree; \
                 obtain a worktree handle via `VcsContext::in_worktree` first"
            ),
            Self::ProtectedBranch { branch, operation } => write!(
                f,
                "refusing to run {operation:?} against protected branch {branch:?}"
            ),
        }
    }
}

impl std::error::Error for SafetyError {}

/// Default protected branch names.
pub fn default_protected_branches() -> HashSet<String> {
    ["main", "master", "develop", "release"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Gate 1: refuse unless `in_worktree_context` is set.
pub fn require_worktree_context(
    in_worktree_context: bool,
    operation: &'static str,
) -> Result<(), SafetyError> {
    if in_worktree_context {
        Ok(())
    } else {
        Err(SafetyError::MainRepoModification { operation })
    }
}

/// Gate 2: refuse if `branch` is in the protected set (exact match).
pub fn require_not_protected(
    branch: &str,
    protected_branches: &HashSet<String>,
    operation: &'static str,
) -> Result<(), SafetyError> {
    if protected_branches.contains(branch) {
        Err(SafetyError::ProtectedBranch {
            branch: branch.to_string(),
            operation,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_context_gate_blocks_main_repo_handle() {
        let err = require_worktree_context(false, "reset --hard").unwrap_err();
        assert_eq!(
            err,
            SafetyError::MainRepoModification {
                operation: "reset --hard"
            }
        );
    }

    #[test]
    fn worktree_context_gate_allows_worktree_handle() {
        require_worktree_context(true, "reset --hard").unwrap();
    }

    #[test]
    fn protected_branch_gate_matches_exactly() {
        let protected = default_protected_branches();
        assert!(require_not_protected("main", &protected, "push").is_err());
        assert!(require_not_protected("main-ish", &protected, "push").is_ok());
        assert!(require_not_protected("orc/TASK-001", &protected, "push").is_ok());
    }
}
