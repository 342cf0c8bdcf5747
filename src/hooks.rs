//! Per-worktree git hook installation.
//!
//! Real `.git/hooks/pre-push` and `pre-commit` scripts, written into a
//! worktree's own hook directory at creation time. This is defense in
//! depth: the in-process gates in [`crate::safety`] remain authoritative,
//! but a hook still fires even if something bypasses this engine and runs
//! `git push` directly from the worktree's shell.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Failed to install hooks into a worktree. Fatal to worktree creation —
/// the worktree manager must not hand back a path when this happens.
#[derive(Debug)]
pub struct HookInstallError {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for HookInstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to install hooks at {}: {}",
            self.path.display(),
            self.message
        )
    }
}

impl std::error::Error for HookInstallError {}

/// Resolve a worktree's private git-dir by reading its `.git` pointer file
/// (`gitdir: <path>`) and returning the resolved, absolute path.
pub fn resolve_git_dir(worktree_path: &Path) -> Result<PathBuf, HookInstallError> {
    let pointer_path = worktree_path.join(".git");
    let contents = std::fs::read_to_string(&pointer_path).map_err(|e| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("reading {}: {e}", pointer_path.display()),
    })?;
    let line = contents.lines().next().unwrap_or_default();
    let raw = line.strip_prefix("gitdir:").map(str::trim).ok_or_else(|| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("{} does not contain a 'gitdir:' pointer", pointer_path.display()),
    })?;
    let git_dir = PathBuf::from(raw);
    let git_dir = if git_dir.is_absolute() {
        git_dir
    } else {
        worktree_path.join(git_dir)
    };
    dunce::canonicalize(&git_dir).map_err(|e| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("canonicalizing {}: {e}", git_dir.display()),
    })
}

fn pre_push_script(task_id: &str, expected_branch: &str, protected_branches: &HashSet<String>) -> String {
    let mut sorted: Vec<&str> = protected_branches.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let list = sorted
        .iter()
        .map(|b| shell_escape::escape(std::borrow::Cow::Borrowed(*b)).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let task_id_q = shell_escape::escape(std::borrow::Cow::Borrowed(task_id)).into_owned();
    let branch_q = shell_escape::escape(std::borrow::Cow::Borrowed(expected_branch)).into_owned();
    format!(
        "#!/bin/sh\n\
         # installed by orc-core for task {task_id_q}, expected branch {branch_q}\n\
         protected=\"{list}\"\n\
         while read -r local_ref local_sha remote_ref remote_sha; do\n\
         \tbranch=$(printf '%s' \"$remote_ref\" | sed 's#refs/heads/##')\n\
         \tfor p in $protected; do\n\
         \t\tif [ \"$branch\" = \"$p\" ]; then\n\
         \t\t\techo \"orc: refusing to push protected branch '$branch' (task {task_id_q}, expected {branch_q})\" >&2\n\
         \t\t\texit 1\n\
         \t\tfi\n\
         \tdone\n\
         done\n\
         exit 0\n"
    )
}

fn pre_commit_script(task_id: &str, expected_branch: &str) -> String {
    let task_id_q = shell_escape::escape(std::borrow::Cow::Borrowed(task_id)).into_owned();
    let branch_q = shell_escape::escape(std::borrow::Cow::Borrowed(expected_branch)).into_owned();
    format!(
        "#!/bin/sh\n\
         # installed by orc-core for task {task_id_q}, expected branch {branch_q}\n\
         current=$(git symbolic-ref --short -q HEAD)\n\
         if [ \"$current\" != {branch_q} ]; then\n\
         \techo \"orc: warning: committing on '$current', expected '{expected_branch}' (task {task_id_q})\" >&2\n\
         fi\n\
         exit 0\n"
    )
}

#[cfg(unix)]
fn write_executable(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o755)
        .open(path)?;
    f.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_executable(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Install `pre-push` and `pre-commit` hooks into `worktree_path`'s own
/// hook directory, and point its local `core.hooksPath` at it. Both values
/// are baked into the generated scripts at this call time, not resolved
/// later.
pub fn install_hooks(
    worktree_path: &Path,
    task_id: &str,
    expected_branch: &str,
    protected_branches: &HashSet<String>,
    set_hooks_path: impl FnOnce(&Path) -> Result<(), HookInstallError>,
) -> Result<(), HookInstallError> {
    let git_dir = resolve_git_dir(worktree_path)?;
    let hooks_dir = git_dir.join("hooks");
    std::fs::create_dir_all(&hooks_dir).map_err(|e| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("creating {}: {e}", hooks_dir.display()),
    })?;

    write_executable(
        &hooks_dir.join("pre-push"),
        &pre_push_script(task_id, expected_branch, protected_branches),
    )
    .map_err(|e| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("writing pre-push: {e}"),
    })?;

    write_executable(
        &hooks_dir.join("pre-commit"),
        &pre_commit_script(task_id, expected_branch),
    )
    .map_err(|e| HookInstallError {
        path: worktree_path.to_path_buf(),
        message: format!("writing pre-commit: {e}"),
    })?;

    set_hooks_path(&hooks_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn resolve_git_dir_reads_pointer_file() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path().join("real-gitdir");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(dir.path().join(".git"), format!("gitdir: {}\n", git_dir.display())).unwrap();

        let resolved = resolve_git_dir(dir.path()).unwrap();
        assert_eq!(resolved, dunce::canonicalize(&git_dir).unwrap());
    }

    #[test]
    fn resolve_git_dir_errors_without_pointer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".git"), "not a pointer file").unwrap();
        assert!(resolve_git_dir(dir.path()).is_err());
    }

    #[test]
    fn generated_hooks_embed_task_id_and_branch() {
        let mut protected = HashSet::new();
        protected.insert("main".to_string());
        let pre_push = pre_push_script("TASK-001", "orc/TASK-001", &protected);
        assert!(pre_push.contains("TASK-001"));
        assert!(pre_push.contains("orc/TASK-001"));
        assert!(pre_push.contains("main"));

        let pre_commit = pre_commit_script("TASK-001", "orc/TASK-001");
        assert!(pre_commit.contains("TASK-001"));
        assert!(pre_commit.contains("orc/TASK-001"));
    }

    #[test]
    fn install_hooks_writes_executable_scripts_and_sets_hooks_path() {
        let worktree = tempfile::tempdir().unwrap();
        let git_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            worktree.path().join(".git"),
            format!("gitdir: {}\n", git_dir.path().display()),
        )
        .unwrap();

        let mut protected = HashSet::new();
        protected.insert("main".to_string());

        let mut hooks_path_set = None;
        install_hooks(worktree.path(), "TASK-001", "orc/TASK-001", &protected, |hooks_dir| {
            hooks_path_set = Some(hooks_dir.to_path_buf());
            Ok(())
        })
        .unwrap();

        let pre_push = git_dir.path().join("hooks/pre-push");
        let pre_commit = git_dir.path().join("hooks/pre-commit");
        assert!(pre_push.exists());
        assert!(pre_commit.exists());
        assert!(hooks_path_set.is_some());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&pre_push).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
