//! End-to-end worktree lifecycle against a real git repository.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use orc_core::command::SystemCommandRunner;
use orc_core::vcs::VcsContext;
use orc_core::worktree_manager::WorktreeManager;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git should be on PATH");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

fn manager(repo: &Path) -> WorktreeManager {
    let runner = Arc::new(SystemCommandRunner);
    let worktree_base = repo.join(".orc/worktrees");
    let ctx = VcsContext::new(repo.to_path_buf(), worktree_base, runner, HashSet::new())
        .expect("repo should be recognized");
    WorktreeManager::new(ctx, orc_core::safety::default_protected_branches())
}

#[test]
fn create_worktree_provisions_hooks_and_gates_the_main_repo() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let manager = manager(tmp.path());

    let path = manager
        .create_worktree("TASK-001", "am", "main", None)
        .expect("worktree creation should succeed");
    assert!(path.exists());
    assert!(path.join(".git").exists());

    let hooks_pointer = std::fs::read_to_string(path.join(".git")).unwrap();
    let gitdir_line = hooks_pointer.trim().strip_prefix("gitdir: ").unwrap();
    let hooks_dir = Path::new(gitdir_line).join("hooks");
    let pre_push = std::fs::read_to_string(hooks_dir.join("pre-push")).unwrap();
    assert!(pre_push.contains("TASK-001"));
    assert!(pre_push.contains("orc/TASK-001-am"));

    // The main repository's own handle is still gated: a destructive op on
    // it refuses before any subprocess runs.
    let runner = Arc::new(SystemCommandRunner);
    let ctx = VcsContext::new(
        tmp.path().to_path_buf(),
        tmp.path().join(".orc/worktrees"),
        runner,
        HashSet::new(),
    )
    .unwrap();
    let err = ctx.handle().reset_hard("HEAD").unwrap_err();
    assert!(err.to_string().contains("refusing to run"));

    manager.cleanup_worktree_at_path(&path).unwrap();
    assert!(!path.exists());
    assert!(manager.list_worktrees().unwrap().iter().all(|w| w.path != path));
}

#[test]
fn worktree_handle_can_reset_hard_without_touching_main_repo_head() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let manager = manager(tmp.path());

    let path = manager
        .create_worktree("TASK-002", "", "main", None)
        .expect("worktree creation should succeed");
    let handle = manager.in_worktree(path.clone());

    let main_head_before = {
        let runner = Arc::new(SystemCommandRunner);
        let ctx = VcsContext::new(
            tmp.path().to_path_buf(),
            tmp.path().join(".orc/worktrees"),
            runner,
            HashSet::new(),
        )
        .unwrap();
        ctx.handle().head_commit().unwrap()
    };

    std::fs::write(path.join("file.txt"), "change\n").unwrap();
    git(&path, &["add", "-A"]);
    git(&path, &["commit", "-q", "-m", "second"]);
    handle.reset_hard(&main_head_before).unwrap();
    assert_eq!(handle.head_commit().unwrap(), main_head_before);

    manager.cleanup_worktree_at_path(&path).unwrap();
}
