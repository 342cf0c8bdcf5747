//! Top-level error type unifying the engine's per-layer errors.

use crate::knowledge::KnowledgeMergeError;
use crate::phase_executor::PhaseError;
use crate::run_driver::RunError;
use crate::safety::SafetyError;
use crate::vcs::VcsError;
use crate::worktree_manager::WorktreeError;

#[derive(Debug)]
pub enum EngineError {
    Safety(SafetyError),
    Vcs(VcsError),
    Worktree(WorktreeError),
    Phase(PhaseError),
    Run(RunError),
    Knowledge(KnowledgeMergeError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safety(e) => write!(f, "{e}"),
            Self::Vcs(e) => write!(f, "{e}"),
            Self::Worktree(e) => write!(f, "{e}"),
            Self::Phase(e) => write!(f, "{e}"),
            Self::Run(e) => write!(f, "{e}"),
            Self::Knowledge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SafetyError> for EngineError {
    fn from(e: SafetyError) -> Self {
        Self::Safety(e)
    }
}

impl From<VcsError> for EngineError {
    fn from(e: VcsError) -> Self {
        Self::Vcs(e)
    }
}

impl From<WorktreeError> for EngineError {
    fn from(e: WorktreeError) -> Self {
        Self::Worktree(e)
    }
}

impl From<PhaseError> for EngineError {
    fn from(e: PhaseError) -> Self {
        Self::Phase(e)
    }
}

impl From<RunError> for EngineError {
    fn from(e: RunError) -> Self {
        Self::Run(e)
    }
}

impl From<KnowledgeMergeError> for EngineError {
    fn from(e: KnowledgeMergeError) -> Self {
        Self::Knowledge(e)
    }
}
