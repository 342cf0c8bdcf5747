//! Worktree lifecycle: the only component allowed to register or
//! deregister a worktree against the main repository.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::hooks::{self, HookInstallError};
use crate::naming;
use crate::vcs::{VcsContext, VcsError, VcsHandle};

#[derive(Debug)]
pub enum WorktreeError {
    Vcs(VcsError),
    HookInstall(HookInstallError),
    /// Both `worktree add -b` and `worktree add <existing>` failed, even
    /// after a prune-and-retry.
    CreationFailed { branch: String, last_error: String },
}

impl std::fmt::Display for WorktreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vcs(e) => write!(f, "{e}"),
            Self::HookInstall(e) => write!(f, "{e}"),
            Self::CreationFailed { branch, last_error } => {
                write!(f, "failed to create worktree for {branch:?}: {last_error}")
            }
        }
    }
}

impl std::error::Error for WorktreeError {}

impl From<VcsError> for WorktreeError {
    fn from(e: VcsError) -> Self {
        Self::Vcs(e)
    }
}

impl From<HookInstallError> for WorktreeError {
    fn from(e: HookInstallError) -> Self {
        Self::HookInstall(e)
    }
}

/// Task identity used as a worktree-manager registry key. An initiative
/// prefix changes the branch (and thus the path), so it's part of the key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TaskKey {
    task_id: String,
    executor_tag: String,
    initiative_prefix: Option<String>,
}

pub struct WorktreeManager {
    ctx: VcsContext,
    protected_branches: HashSet<String>,
    create_lock: Mutex<()>,
    registry: DashMap<TaskKey, PathBuf>,
}

impl WorktreeManager {
    pub fn new(ctx: VcsContext, protected_branches: HashSet<String>) -> Self {
        Self {
            ctx,
            protected_branches,
            create_lock: Mutex::new(()),
            registry: DashMap::new(),
        }
    }

    fn branch_and_dir(&self, task_id: &str, executor_tag: &str, initiative_prefix: Option<&str>) -> (String, String) {
        match initiative_prefix {
            Some(prefix) => (
                naming::branch_name_with_prefix(task_id, executor_tag, prefix),
                naming::worktree_dir_name_with_prefix(task_id, executor_tag, prefix),
            ),
            None => (
                naming::branch_name(task_id, executor_tag),
                naming::worktree_dir_name(task_id, executor_tag),
            ),
        }
    }

    /// Create an isolated worktree for `task_id`, branching from
    /// `base_branch`. Never modifies the main repository's checked-out
    /// branch. Installs hooks before returning; a hook-install failure
    /// tears the worktree back down and is returned as an error — this
    /// call yields a fully-provisioned worktree or nothing at all.
    pub fn create_worktree(
        &self,
        task_id: &str,
        executor_tag: &str,
        base_branch: &str,
        initiative_prefix: Option<&str>,
    ) -> Result<PathBuf, WorktreeError> {
        let (branch, dir_name) = self.branch_and_dir(task_id, executor_tag, initiative_prefix);
        let path = self.ctx.worktree_base_dir().join(&dir_name);
        std::fs::create_dir_all(self.ctx.worktree_base_dir()).ok();

        let handle = self.ctx.handle();
        self.attempt_create(&handle, &path, &branch, base_branch)?;

        if let Err(e) = self.install_hooks_or_rollback(&handle, &path, task_id, &branch) {
            return Err(e);
        }

        let absolute = dunce::canonicalize(&path).unwrap_or(path);
        self.registry.insert(
            TaskKey {
                task_id: task_id.to_string(),
                executor_tag: executor_tag.to_string(),
                initiative_prefix: initiative_prefix.map(str::to_string),
            },
            absolute.clone(),
        );
        Ok(absolute)
    }

    fn attempt_create(
        &self,
        handle: &VcsHandle,
        path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), WorktreeError> {
        let _guard = self.create_lock.lock().unwrap();

        let first = handle.worktree_add(path, branch, Some(base_branch));
        if first.is_ok() {
            return Ok(());
        }
        let second = handle.worktree_add_existing_branch(path, branch);
        if second.is_ok() {
            return Ok(());
        }

        let _ = handle.worktree_prune();

        let third = handle.worktree_add(path, branch, Some(base_branch));
        if third.is_ok() {
            return Ok(());
        }
        let fourth = handle.worktree_add_existing_branch(path, branch);
        if fourth.is_ok() {
            return Ok(());
        }

        Err(WorktreeError::CreationFailed {
            branch: branch.to_string(),
            last_error: fourth.unwrap_err().to_string(),
        })
    }

    fn install_hooks_or_rollback(
        &self,
        handle: &VcsHandle,
        path: &Path,
        task_id: &str,
        branch: &str,
    ) -> Result<(), WorktreeError> {
        let protected = self.protected_branches.clone();
        let path_for_config = path.to_path_buf();
        let result = hooks::install_hooks(path, task_id, branch, &protected, |hooks_dir| {
            handle
                .in_worktree(&path_for_config)
                .run_config_set_hooks_path(hooks_dir)
                .map_err(|e| HookInstallError {
                    path: path_for_config.clone(),
                    message: e.to_string(),
                })
        });

        if let Err(e) = result {
            log::warn!("hook installation failed for {}, rolling back worktree: {e}", path.display());
            let _ = handle.worktree_remove(path, true);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove the worktree registered for `task_id` (and its VCS
    /// registration). A no-op if none is registered.
    pub fn cleanup_worktree(
        &self,
        task_id: &str,
        executor_tag: &str,
        initiative_prefix: Option<&str>,
    ) -> Result<(), WorktreeError> {
        let key = TaskKey {
            task_id: task_id.to_string(),
            executor_tag: executor_tag.to_string(),
            initiative_prefix: initiative_prefix.map(str::to_string),
        };
        let Some((_, path)) = self.registry.remove(&key) else {
            return Ok(());
        };
        self.cleanup_worktree_at_path(&path)
    }

    /// Remove the worktree at `path`. A no-op for an empty path.
    pub fn cleanup_worktree_at_path(&self, path: &Path) -> Result<(), WorktreeError> {
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let handle = self.ctx.handle();
        if handle.worktree_remove(path, false).is_err() {
            handle.worktree_remove(path, true)?;
        }
        self.registry.retain(|_, p| p != path);
        Ok(())
    }

    /// A safety-unlocked handle bound to `path`, with its own mutex —
    /// concurrent operations on different worktrees never block each
    /// other.
    pub fn in_worktree(&self, path: impl Into<PathBuf>) -> VcsHandle {
        self.ctx.handle().in_worktree(path)
    }

    pub fn prune_worktrees(&self) -> Result<(), WorktreeError> {
        self.ctx.handle().worktree_prune().map_err(Into::into)
    }

    pub fn list_worktrees(&self) -> Result<Vec<crate::vcs::Worktree>, WorktreeError> {
        self.ctx.handle().worktree_list().map_err(Into::into)
    }
}
