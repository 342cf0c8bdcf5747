//! Checkpoint commits.

use chrono::{DateTime, Utc};

use crate::vcs::{VcsError, VcsHandle};

/// A commit recorded at a phase boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub phase_id: String,
    pub commit_sha: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Default checkpoint commit-message prefix.
pub const DEFAULT_COMMIT_PREFIX: &str = "[orc]";

/// Compose a checkpoint commit message:
/// `"<commit_prefix> <task_id>: <phase_id> - <message>"`.
pub fn format_message(commit_prefix: &str, task_id: &str, phase_id: &str, message: &str) -> String {
    format!("{commit_prefix} {task_id}: {phase_id} - {message}")
}

/// Stage everything and commit, under the handle's mutex. Falls back to an
/// allow-empty commit on "nothing to commit" so a `checkpoint == true`
/// phase always produces a commit.
pub fn record_checkpoint(
    handle: &VcsHandle,
    task_id: &str,
    phase_id: &str,
    commit_prefix: &str,
    message: &str,
) -> Result<Checkpoint, VcsError> {
    let full_message = format_message(commit_prefix, task_id, phase_id, message);

    handle.stage_all()?;
    match handle.commit(&full_message) {
        Ok(_) => {}
        Err(VcsError::NothingToCommit) => {
            handle.commit_allow_empty(&full_message)?;
        }
        Err(e) => return Err(e),
    }

    let commit_sha = handle.head_commit()?;
    log::info!("recorded checkpoint {task_id}/{phase_id} at {commit_sha}");
    Ok(Checkpoint {
        task_id: task_id.to_string(),
        phase_id: phase_id.to_string(),
        commit_sha,
        message: full_message,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_message_per_spec() {
        assert_eq!(
            format_message("[orc]", "TASK-001", "implement", "add parser"),
            "[orc] TASK-001: implement - add parser"
        );
    }
}
