//! Drives a [`WorkflowRun`] from `Pending` to a terminal state: phase
//! selection, worktree provisioning, and the explicit status transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;

use crate::command::CommandRunner;
use crate::phase_executor::{self, PhaseError, PhaseExecutorContext, PhaseOutcome};
use crate::vcs::{VcsError, VcsHandle};
use crate::worktree_manager::{WorktreeError, WorktreeManager};
use crate::workflow::{PhaseId, PhaseStatus, RunId, RunStatus, TaskContext, Workflow, WorkflowPhase, WorkflowRun};

#[derive(Debug)]
pub enum RunError {
    UnknownRun { run_id: RunId },
    Worktree(WorktreeError),
    Vcs(VcsError),
    Phase(PhaseError),
    /// `advance` was called on a run with no executable phase and no
    /// terminal status — a configuration error (a cycle in `depends_on`, or
    /// every remaining phase's `condition` evaluates false).
    NoExecutablePhase { run_id: RunId },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRun { run_id } => write!(f, "no such run: {run_id}"),
            Self::Worktree(e) => write!(f, "{e}"),
            Self::Vcs(e) => write!(f, "{e}"),
            Self::Phase(e) => write!(f, "{e}"),
            Self::NoExecutablePhase { run_id } => {
                write!(f, "run {run_id} has no executable phase but is not terminal")
            }
        }
    }
}

impl std::error::Error for RunError {}

impl From<WorktreeError> for RunError {
    fn from(e: WorktreeError) -> Self {
        Self::Worktree(e)
    }
}

impl From<VcsError> for RunError {
    fn from(e: VcsError) -> Self {
        Self::Vcs(e)
    }
}

impl From<PhaseError> for RunError {
    fn from(e: PhaseError) -> Self {
        Self::Phase(e)
    }
}

/// One run's mutable bookkeeping the driver needs beyond `WorkflowRun`
/// itself: its worktree path and a cancellation channel for whatever
/// subprocess it currently owns.
struct RunEntry {
    run: Mutex<WorkflowRun>,
    worktree_path: std::path::PathBuf,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

/// Orchestrates many concurrent [`WorkflowRun`]s, one OS thread each,
/// each in its own worktree. Phase execution itself is delegated to
/// [`phase_executor::execute_phase`]; this type owns sequencing, worktree
/// lifecycle, and the explicit status transitions.
pub struct RunDriver {
    worktrees: Arc<WorktreeManager>,
    runner: Arc<dyn CommandRunner>,
    runs: DashMap<RunId, RunEntry>,
    assistant_binary: String,
    assistant_timeout: std::time::Duration,
    commit_prefix: String,
}

impl RunDriver {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        runner: Arc<dyn CommandRunner>,
        assistant_binary: impl Into<String>,
        assistant_timeout: std::time::Duration,
        commit_prefix: impl Into<String>,
    ) -> Self {
        Self {
            worktrees,
            runner,
            runs: DashMap::new(),
            assistant_binary: assistant_binary.into(),
            assistant_timeout,
            commit_prefix: commit_prefix.into(),
        }
    }

    /// Materialize a `Pending` run, provision its worktree, snapshot the
    /// initial variables, and transition to `Running`.
    pub fn start(
        &self,
        workflow: &Workflow,
        context: TaskContext,
        initial_variables: HashMap<String, serde_json::Value>,
    ) -> Result<RunId, RunError> {
        let mut run = WorkflowRun::new(workflow, context.clone());
        for (key, value) in initial_variables {
            run.variables.insert(key, value);
        }

        let path = self.worktrees.create_worktree(
            &context.task_id,
            &context.executor_tag,
            &context.base_branch,
            context.initiative_prefix.as_deref(),
        )?;

        run.status = RunStatus::Running;
        let run_id = run.id;

        let (cancel_tx, cancel_rx) = crossbeam_channel::unbounded();
        self.runs.insert(
            run_id,
            RunEntry {
                run: Mutex::new(run),
                worktree_path: path,
                cancel_tx,
                cancel_rx,
            },
        );
        Ok(run_id)
    }

    fn handle_for(&self, entry: &RunEntry) -> VcsHandle {
        self.worktrees.in_worktree(entry.worktree_path.clone())
    }

    /// Select the next executable phase and run it to a terminal-for-this-call
    /// outcome. Repeatedly call until the run's status is terminal.
    pub fn advance(
        &self,
        run_id: RunId,
        workflow: &Workflow,
        templates: &HashMap<PhaseId, crate::workflow::PhaseTemplate>,
    ) -> Result<RunStatus, RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::UnknownRun { run_id })?;
        {
            let run = entry.run.lock().unwrap();
            if run.status.is_terminal() {
                return Ok(run.status);
            }
        }

        let handle = self.handle_for(&entry);
        let next_phase = {
            let run = entry.run.lock().unwrap();
            next_executable_phase(&run, workflow)
        };

        let Some(phase_id) = next_phase else {
            let all_done = {
                let mut run = entry.run.lock().unwrap();
                let done = run.all_phases_terminal_success();
                if done {
                    run.status = RunStatus::Completed;
                }
                done
            };
            drop(entry);
            if all_done {
                self.complete(run_id, true)?;
                return Ok(RunStatus::Completed);
            }
            return Err(RunError::NoExecutablePhase { run_id });
        };

        let ctx = PhaseExecutorContext {
            runner: self.runner.clone(),
            handle: &handle,
            assistant_binary: self.assistant_binary.clone(),
            assistant_timeout: self.assistant_timeout,
            commit_prefix: self.commit_prefix.clone(),
        };

        let outcome = {
            let mut run = entry.run.lock().unwrap();
            phase_executor::execute_phase(&ctx, &mut run, workflow, templates, &phase_id, &entry.cancel_rx)
        };

        // `entry` (a DashMap guard) must not be held across `self.complete`,
        // which needs to remove the same key, so every branch below
        // finishes with its own status/error before dropping it explicitly.
        let (complete_as, result): (Option<bool>, Result<RunStatus, RunError>) = match outcome {
            Ok(PhaseOutcome::Completed) | Ok(PhaseOutcome::Skipped) | Ok(PhaseOutcome::LoopTo(_)) => {
                let run = entry.run.lock().unwrap();
                (None, Ok(run.status))
            }
            Ok(PhaseOutcome::AwaitingHuman) => {
                let mut run = entry.run.lock().unwrap();
                run.status = RunStatus::Paused;
                (None, Ok(RunStatus::Paused))
            }
            Ok(PhaseOutcome::RetryFrom(target)) => {
                let mut run = entry.run.lock().unwrap();
                if let Some(record) = run.phases.get_mut(&phase_id) {
                    record.status = PhaseStatus::Pending;
                    record.retried = true;
                }
                if let Some(record) = run.phases.get_mut(&target) {
                    record.status = PhaseStatus::Pending;
                    record.iteration += 1;
                }
                (None, Ok(run.status))
            }
            Ok(PhaseOutcome::Failed) | Err(PhaseError::Cancelled { .. }) => {
                let mut run = entry.run.lock().unwrap();
                run.status = RunStatus::Failed;
                run.error = Some(format!("phase {phase_id} failed"));
                (Some(false), Ok(RunStatus::Failed))
            }
            Err(e) => {
                let mut run = entry.run.lock().unwrap();
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                (Some(false), Err(e.into()))
            }
        };

        drop(entry);
        if let Some(retain) = complete_as {
            self.complete(run_id, retain)?;
        }
        result
    }

    /// Transition to `Paused`, aborting any in-progress rebase first so the
    /// worktree is never left mid-operation.
    pub fn suspend(&self, run_id: RunId) -> Result<(), RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::UnknownRun { run_id })?;
        let handle = self.handle_for(&entry);
        let _ = handle.rebase_abort();
        let mut run = entry.run.lock().unwrap();
        if !run.status.is_terminal() {
            run.status = RunStatus::Paused;
        }
        Ok(())
    }

    pub fn resume(&self, run_id: RunId) -> Result<(), RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::UnknownRun { run_id })?;
        let mut run = entry.run.lock().unwrap();
        if run.status == RunStatus::Paused {
            run.status = RunStatus::Running;
        }
        Ok(())
    }

    /// Resolve a `Human` gate's external approval: the phase moves from
    /// `AwaitingApproval` to `Completed` and the run resumes to `Running` so
    /// `advance` can select its dependents next.
    pub fn approve_phase(&self, run_id: RunId, phase_id: &str) -> Result<(), RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::UnknownRun { run_id })?;
        let mut run = entry.run.lock().unwrap();
        if let Some(record) = run.phases.get_mut(phase_id) {
            if record.status == PhaseStatus::AwaitingApproval {
                record.status = PhaseStatus::Completed;
            }
        }
        if run.status == RunStatus::Paused {
            run.status = RunStatus::Running;
        }
        Ok(())
    }

    /// Cancel the run: signal its current subprocess, abort any rebase, and
    /// transition to `Cancelled`. A no-op on an already-terminal run.
    pub fn cancel(&self, run_id: RunId) -> Result<(), RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::UnknownRun { run_id })?;
        {
            let run = entry.run.lock().unwrap();
            if run.status.is_terminal() {
                return Ok(());
            }
        }
        let _ = entry.cancel_tx.send(());
        let handle = self.handle_for(&entry);
        let _ = handle.rebase_abort();
        {
            let mut run = entry.run.lock().unwrap();
            run.status = RunStatus::Cancelled;
        }
        drop(entry);
        self.complete(run_id, false)
    }

    /// Tear down the run's worktree unless `retain` is set. A failed or
    /// cancelled run's worktree is left in place regardless of `retain`,
    /// for human inspection; only clean terminal success is torn down by
    /// default.
    pub fn complete(&self, run_id: RunId, retain: bool) -> Result<(), RunError> {
        if let Some((_, entry)) = self.runs.remove(&run_id) {
            let run = entry.run.into_inner().unwrap();
            if run.status == RunStatus::Completed && !retain {
                self.worktrees.cleanup_worktree_at_path(&entry.worktree_path)?;
            }
            self.runs.insert(
                run_id,
                RunEntry {
                    run: Mutex::new(run),
                    worktree_path: entry.worktree_path,
                    cancel_tx: entry.cancel_tx,
                    cancel_rx: entry.cancel_rx,
                },
            );
        }
        Ok(())
    }

    pub fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.runs.get(&run_id).map(|e| e.run.lock().unwrap().status)
    }
}

/// Smallest `sequence` whose `depends_on` is entirely `Completed`/`Skipped`
/// and whose `condition` (if any) evaluates true, ties broken by phase id.
fn next_executable_phase(run: &WorkflowRun, workflow: &Workflow) -> Option<PhaseId> {
    let mut candidates: Vec<&WorkflowPhase> = workflow
        .phases
        .iter()
        .filter(|p| {
            run.phases
                .get(&p.phase_template_id)
                .map(|r| r.status == PhaseStatus::Pending)
                .unwrap_or(false)
        })
        .filter(|p| {
            p.depends_on.iter().all(|dep| {
                run.phases
                    .get(dep)
                    .map(|r| matches!(r.status, PhaseStatus::Completed | PhaseStatus::Skipped))
                    .unwrap_or(false)
            })
        })
        .filter(|p| {
            p.condition
                .as_ref()
                .map(|c| c.evaluate(&run.variables))
                .unwrap_or(true)
        })
        .collect();

    candidates.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.phase_template_id.cmp(&b.phase_template_id)));
    candidates.first().map(|p| p.phase_template_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PhaseOverrides, WorkflowPhase};

    fn workflow_with(phases: Vec<WorkflowPhase>) -> Workflow {
        Workflow {
            id: "wf".to_string(),
            phases,
            variables: vec![],
            triggers: vec![],
        }
    }

    #[test]
    fn selects_smallest_sequence_with_satisfied_dependencies() {
        let workflow = workflow_with(vec![
            WorkflowPhase {
                phase_template_id: "b".to_string(),
                sequence: 1,
                depends_on: vec!["a".to_string()],
                condition: None,
                overrides: PhaseOverrides::default(),
            },
            WorkflowPhase {
                phase_template_id: "a".to_string(),
                sequence: 0,
                depends_on: vec![],
                condition: None,
                overrides: PhaseOverrides::default(),
            },
        ]);
        let run = WorkflowRun::new(
            &workflow,
            TaskContext {
                task_id: "TASK-001".to_string(),
                executor_tag: String::new(),
                base_branch: "main".to_string(),
                initiative_prefix: None,
            },
        );
        assert_eq!(next_executable_phase(&run, &workflow), Some("a".to_string()));
    }

    #[test]
    fn unsatisfied_dependency_blocks_selection() {
        let workflow = workflow_with(vec![WorkflowPhase {
            phase_template_id: "b".to_string(),
            sequence: 1,
            depends_on: vec!["a".to_string()],
            condition: None,
            overrides: PhaseOverrides::default(),
        }]);
        let run = WorkflowRun::new(
            &workflow,
            TaskContext {
                task_id: "TASK-001".to_string(),
                executor_tag: String::new(),
                base_branch: "main".to_string(),
                initiative_prefix: None,
            },
        );
        assert_eq!(next_executable_phase(&run, &workflow), None);
    }

    #[test]
    fn ties_on_sequence_break_on_phase_id() {
        let workflow = workflow_with(vec![
            WorkflowPhase {
                phase_template_id: "z".to_string(),
                sequence: 0,
                depends_on: vec![],
                condition: None,
                overrides: PhaseOverrides::default(),
            },
            WorkflowPhase {
                phase_template_id: "a".to_string(),
                sequence: 0,
                depends_on: vec![],
                condition: None,
                overrides: PhaseOverrides::default(),
            },
        ]);
        let run = WorkflowRun::new(
            &workflow,
            TaskContext {
                task_id: "TASK-001".to_string(),
                executor_tag: String::new(),
                base_branch: "main".to_string(),
                initiative_prefix: None,
            },
        );
        assert_eq!(next_executable_phase(&run, &workflow), Some("a".to_string()));
    }
}
