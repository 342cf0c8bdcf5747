//! VCS context: a handle bound to a repository (and, once unlocked, a
//! specific worktree within it) exposing the operations the rest of the
//! engine needs.

pub mod error;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use error::VcsError;

use crate::command::CommandRunner;
use crate::safety::{self, SafetyError};

/// A single worktree as reported by `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
}

/// Entry point: bind to a repository. Produces [`VcsHandle`]s.
pub struct VcsContext {
    repo_path: PathBuf,
    worktree_base_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    protected_branches: Arc<HashSet<String>>,
}

impl VcsContext {
    /// Bind to an existing repository at `repo_path`. Fails if `repo_path`
    /// is not a git repository.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        protected_branches: HashSet<String>,
    ) -> Result<Self, VcsError> {
        let repo_path = repo_path.into();
        let worktree_base_dir = worktree_base_dir.into();
        let ctx = Self {
            repo_path: repo_path.clone(),
            worktree_base_dir,
            runner,
            protected_branches: Arc::new(protected_branches),
        };
        ctx.handle()
            .run(&["rev-parse", "--git-dir"])
            .map_err(|_| VcsError::NotARepository { path: repo_path })?;
        Ok(ctx)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base_dir(&self) -> &Path {
        &self.worktree_base_dir
    }

    /// A handle bound to the main repository's own working tree.
    /// `in_worktree_context` is `false` — destructive operations will be
    /// refused by the safety layer until [`VcsHandle::in_worktree`] is used.
    pub fn handle(&self) -> VcsHandle {
        VcsHandle {
            repo_path: self.repo_path.clone(),
            work_dir: self.repo_path.clone(),
            runner: self.runner.clone(),
            protected_branches: self.protected_branches.clone(),
            in_worktree_context: false,
            op_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// A handle bound to a repository and a specific working directory within it.
///
/// Cloning a handle shares its operation mutex (so two clones of the same
/// handle still serialize against each other); deriving a new handle via
/// [`in_worktree`](Self::in_worktree) gets its own independent mutex, so
/// concurrent operations against different worktrees never block each
/// other.
#[derive(Clone)]
pub struct VcsHandle {
    repo_path: PathBuf,
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    protected_branches: Arc<HashSet<String>>,
    in_worktree_context: bool,
    op_lock: Arc<Mutex<()>>,
}

impl VcsHandle {
    pub fn in_worktree_context(&self) -> bool {
        self.in_worktree_context
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The only way to obtain a safety-unlocked handle: bind `work_dir` to
    /// a worktree path, with its own mutex.
    pub fn in_worktree(&self, work_dir: impl Into<PathBuf>) -> VcsHandle {
        VcsHandle {
            repo_path: self.repo_path.clone(),
            work_dir: work_dir.into(),
            runner: self.runner.clone(),
            protected_branches: self.protected_branches.clone(),
            in_worktree_context: true,
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, crate::command::CommandError> {
        let _guard = self.op_lock.lock().unwrap();
        self.runner.run(&self.work_dir, "git", args)
    }

    fn gated<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Self) -> Result<T, VcsError>,
    ) -> Result<T, VcsError> {
        safety::require_worktree_context(self.in_worktree_context, operation)
            .map_err(VcsError::from)?;
        f(self)
    }

    fn gated_on_branch<T>(
        &self,
        operation: &'static str,
        branch: &str,
        worktree_gated: bool,
        f: impl FnOnce(&Self) -> Result<T, VcsError>,
    ) -> Result<T, VcsError> {
        if worktree_gated {
            safety::require_worktree_context(self.in_worktree_context, operation)
                .map_err(VcsError::from)?;
        }
        safety::require_not_protected(branch, &self.protected_branches, operation)
            .map_err(VcsError::from)?;
        f(self)
    }

    // -- read-only / non-gated operations --------------------------------

    pub fn current_branch(&self) -> Result<String, VcsError> {
        self.run(&["branch", "--show-current"])
            .map_err(|e| error::classify("branch --show-current", None, e))
    }

    pub fn create_branch(&self, branch: &str, base: &str) -> Result<(), VcsError> {
        self.run(&["branch", branch, base])
            .map(|_| ())
            .map_err(|e| error::classify("branch", Some(branch), e))
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<(), VcsError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, branch])
            .map(|_| ())
            .map_err(|e| error::classify("branch -d", Some(branch), e))
    }

    pub fn fetch(&self, remote: &str) -> Result<(), VcsError> {
        self.run(&["fetch", remote])
            .map(|_| ())
            .map_err(|e| error::classify("fetch", None, e))
    }

    pub fn pull(&self) -> Result<(), VcsError> {
        self.run(&["pull"])
            .map(|_| ())
            .map_err(|e| error::classify("pull", None, e))
    }

    /// Number of commits reachable from `to` but not `from`.
    pub fn count_commits(&self, from: &str, to: &str) -> Result<u32, VcsError> {
        let out = self
            .run(&["rev-list", "--count", &format!("{from}..{to}")])
            .map_err(|e| error::classify("rev-list --count", None, e))?;
        out.trim().parse().map_err(|_| {
            VcsError::command(
                "rev-list --count",
                crate::command::CommandError {
                    program: "git".to_string(),
                    args: vec!["rev-list".to_string(), "--count".to_string()],
                    workdir: self.work_dir.clone(),
                    message: format!("unexpected output: {out:?}"),
                    exit_code: None,
                },
            )
        })
    }

    pub fn diff_between(&self, from: &str, to: &str) -> Result<String, VcsError> {
        self.run(&["diff", &format!("{from}..{to}")])
            .map_err(|e| error::classify("diff", None, e))
    }

    pub fn diff_staged(&self) -> Result<String, VcsError> {
        self.run(&["diff", "--cached"])
            .map_err(|e| error::classify("diff --cached", None, e))
    }

    pub fn status_short(&self) -> Result<String, VcsError> {
        self.run(&["status", "--porcelain"])
            .map_err(|e| error::classify("status", None, e))
    }

    pub fn is_clean(&self) -> Result<bool, VcsError> {
        Ok(self.status_short()?.is_empty())
    }

    pub fn head_commit(&self) -> Result<String, VcsError> {
        self.run(&["rev-parse", "HEAD"])
            .map_err(|e| error::classify("rev-parse HEAD", None, e))
    }

    pub fn remote_url(&self, remote: &str) -> Result<String, VcsError> {
        self.run(&["remote", "get-url", remote])
            .map_err(|e| error::classify("remote get-url", None, e))
    }

    // -- gated, destructive operations -----------------------------------

    /// Requires worktree context: staging changes against the main
    /// repository's working tree is a step toward a main-repo commit, which
    /// is exactly what the worktree-context gate exists to block.
    pub fn stage_all(&self) -> Result<(), VcsError> {
        self.gated("add -A", |h| {
            h.run(&["add", "-A"])
                .map(|_| ())
                .map_err(|e| error::classify("add -A", None, e))
        })
    }

    /// Requires worktree context; see [`stage_all`](Self::stage_all).
    pub fn stage_paths(&self, paths: &[&str]) -> Result<(), VcsError> {
        self.gated("add", |h| {
            let mut args = vec!["add"];
            args.extend(paths);
            h.run(&args)
                .map(|_| ())
                .map_err(|e| error::classify("add", None, e))
        })
    }

    /// Requires worktree context.
    pub fn commit(&self, message: &str) -> Result<(), VcsError> {
        self.gated("commit", |h| {
            h.run(&["commit", "-m", message])
                .map(|_| ())
                .map_err(|e| error::classify("commit", None, e))
        })
    }

    /// Requires worktree context.
    pub fn commit_allow_empty(&self, message: &str) -> Result<(), VcsError> {
        self.gated("commit --allow-empty", |h| {
            h.run(&["commit", "--allow-empty", "-m", message])
                .map(|_| ())
                .map_err(|e| error::classify("commit --allow-empty", None, e))
        })
    }

    /// Automated checkout of `branch`. Requires worktree context.
    pub fn checkout(&self, branch: &str) -> Result<(), VcsError> {
        self.gated("checkout", |h| {
            h.run(&["checkout", branch])
                .map(|_| ())
                .map_err(|e| error::classify("checkout", Some(branch), e))
        })
    }

    /// `git reset --hard <target>`. Requires worktree context; refuses a
    /// protected current branch.
    pub fn reset_hard(&self, target: &str) -> Result<(), VcsError> {
        let branch = self.current_branch().unwrap_or_default();
        self.gated_on_branch("reset --hard", &branch, true, |h| {
            h.run(&["reset", "--hard", target])
                .map(|_| ())
                .map_err(|e| error::classify("reset --hard", None, e))
        })
    }

    /// `git merge <other>`. Requires worktree context.
    pub fn merge(&self, other: &str) -> Result<String, VcsError> {
        self.gated("merge", |h| {
            h.run(&["merge", other])
                .map_err(|e| error::classify("merge", None, e))
        })
    }

    /// Push `branch` to `remote`. Requires worktree context; refuses a
    /// protected branch.
    pub fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<(), VcsError> {
        self.gated_on_branch("push", branch, true, |h| {
            let mut args = vec!["push"];
            if set_upstream {
                args.push("-u");
            }
            args.push(remote);
            args.push(branch);
            h.run(&args)
                .map(|_| ())
                .map_err(|e| error::classify("push", Some(branch), e))
        })
    }

    /// `git push --force-with-lease`. Requires worktree context; refuses a
    /// protected branch unconditionally, regardless of any caller-supplied
    /// override.
    pub fn force_push(&self, remote: &str, branch: &str) -> Result<(), VcsError> {
        self.gated_on_branch("force push", branch, true, |h| {
            h.run(&["push", "--force-with-lease", remote, branch])
                .map(|_| ())
                .map_err(|e| error::classify("push --force-with-lease", Some(branch), e))
        })
    }

    pub fn rebase(&self, onto: &str) -> Result<String, VcsError> {
        self.gated("rebase", |h| {
            h.run(&["rebase", onto])
                .map_err(|e| error::classify("rebase", None, e))
        })
    }

    /// Server-side 3-way merge-tree check: does not touch the working
    /// tree. `base` is computed as the merge-base of `onto` and `ours`.
    pub fn merge_tree(&self, onto: &str, ours: &str) -> Result<String, VcsError> {
        let base = self
            .run(&["merge-base", onto, ours])
            .map_err(|e| error::classify("merge-base", None, e))?;
        self.run(&["merge-tree", base.trim(), onto, ours])
            .map_err(|e| error::classify("merge-tree", None, e))
    }

    pub fn rebase_abort(&self) -> Result<(), VcsError> {
        self.run(&["rebase", "--abort"])
            .map(|_| ())
            .map_err(|e| error::classify("rebase --abort", None, e))
    }

    // -- worktree registration --------------------------------------------

    pub fn worktree_add(&self, path: &Path, branch: &str, base: Option<&str>) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "add", "-b", branch, &path_str];
        if let Some(base) = base {
            args.push(base);
        }
        self.run(&args)
            .map(|_| ())
            .map_err(|e| error::classify("worktree add", Some(&path_str), e))
    }

    pub fn worktree_add_existing_branch(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "add", &path_str, branch])
            .map(|_| ())
            .map_err(|e| error::classify("worktree add", Some(&path_str), e))
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run(&args)
            .map(|_| ())
            .map_err(|e| error::classify("worktree remove", Some(&path_str), e))
    }

    pub fn worktree_prune(&self) -> Result<(), VcsError> {
        self.run(&["worktree", "prune"])
            .map(|_| ())
            .map_err(|e| error::classify("worktree prune", None, e))
    }

    /// Set this worktree's local `core.hooksPath` to an absolute path.
    pub fn run_config_set_hooks_path(&self, hooks_dir: &Path) -> Result<(), VcsError> {
        let hooks_dir_str = hooks_dir.to_string_lossy().to_string();
        self.run(&["config", "--local", "core.hooksPath", &hooks_dir_str])
            .map(|_| ())
            .map_err(|e| error::classify("config core.hooksPath", None, e))
    }

    pub fn worktree_list(&self) -> Result<Vec<Worktree>, VcsError> {
        let raw = self
            .run(&["worktree", "list", "--porcelain"])
            .map_err(|e| error::classify("worktree list", None, e))?;
        Ok(parse_worktree_porcelain(&raw))
    }
}

impl From<SafetyError> for VcsError {
    fn from(e: SafetyError) -> Self {
        VcsError::Safety(e)
    }
}

/// Parse `git worktree list --porcelain` output into [`Worktree`] records.
/// The literal porcelain line `detached` maps to branch `"(detached)"`.
fn parse_worktree_porcelain(raw: &str) -> Vec<Worktree> {
    let mut out = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch = String::new();

    let flush = |path: &mut Option<PathBuf>, head: &mut String, branch: &mut String, out: &mut Vec<Worktree>| {
        if let Some(p) = path.take() {
            out.push(Worktree {
                path: p,
                branch: std::mem::take(branch),
                head_commit: std::mem::take(head),
            });
        }
    };

    for line in raw.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            flush(&mut path, &mut head, &mut branch, &mut out);
            path = Some(PathBuf::from(p));
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = b
                .strip_prefix("refs/heads/")
                .unwrap_or(b)
                .to_string();
        } else if line == "detached" {
            branch = "(detached)".to_string();
        }
    }
    flush(&mut path, &mut head, &mut branch, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_branch_and_detached_entries() {
        let raw = "\
worktree /repo
HEAD abc123
branch refs/heads/main

worktree /repo/.orc/worktrees/orc-TASK-001
HEAD def456
detached
";
        let worktrees = parse_worktree_porcelain(raw);
        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[0].branch, "main");
        assert_eq!(worktrees[1].branch, "(detached)");
        assert_eq!(worktrees[1].head_commit, "def456");
    }

    #[test]
    fn porcelain_parse_snapshot() {
        let raw = "\
worktree /repo
HEAD abc123
branch refs/heads/main

worktree /repo/.orc/worktrees/orc-TASK-001
HEAD def456
detached
";
        let worktrees = parse_worktree_porcelain(raw);
        insta::assert_debug_snapshot!(worktrees, @r#"
        [
            Worktree {
                path: "/repo",
                branch: "main",
                head_commit: "abc123",
            },
            Worktree {
                path: "/repo/.orc/worktrees/orc-TASK-001",
                branch: "(detached)",
                head_commit: "def456",
            },
        ]
        "#);
    }
}
