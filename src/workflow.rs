//! Workflow template types and the mutable state of a single run.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PhaseId = String;
pub type WorkflowId = String;

/// Opaque identifier for one execution of a [`Workflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The task this run executes against: which task id, which executor tag,
/// which branch to base the worktree on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub executor_tag: String,
    pub base_branch: String,
    pub initiative_prefix: Option<String>,
}

/// A reusable template for one step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: PhaseId,
    pub display_name: String,
    pub prompt: PromptSource,
    pub input_vars: Vec<String>,
    pub output: Option<PhaseOutput>,
    pub produces_artifact: bool,
    pub checkpoint: bool,
    pub max_iterations: Option<u32>,
    pub gate_type: GateType,
    pub retry_from_phase: Option<PhaseId>,
    pub quality_checks: Vec<QualityCheck>,
    pub tool_access: Option<serde_json::Value>,
    pub hooks: Option<serde_json::Value>,
    /// A "test -> fix -> test" style loop: on success, evaluate `condition`
    /// against the phase's own output; while true and under `max_iterations`,
    /// reset `target` back to `Pending` instead of advancing.
    pub loop_spec: Option<LoopSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    pub target: PhaseId,
    pub condition: Predicate,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PromptSource {
    Embedded(String),
    Inline(String),
    File(std::path::PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub var_name: String,
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum OutputKind {
    Document,
    Tests,
    Code,
    Findings,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum GateType {
    Auto,
    Human,
    Skip,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub kind: String,
    pub name: String,
    pub enabled: bool,
    pub on_failure: OnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum OnFailure {
    Block,
    Warn,
}

/// The default iteration ceiling when neither a run override nor the
/// template specifies one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// One phase slot within a [`Workflow`]'s declared sequence, binding a
/// [`PhaseTemplate`] into the run graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub phase_template_id: PhaseId,
    pub sequence: u32,
    pub depends_on: Vec<PhaseId>,
    pub condition: Option<Predicate>,
    pub overrides: PhaseOverrides,
}

/// Per-instantiation overrides of a [`PhaseTemplate`]'s defaults. A
/// workflow author sets one of these on a [`WorkflowPhase`] to customize a
/// shared template for that one slot without forking it.
///
/// There is deliberately no `model` override: [`PhaseTemplate`] has no
/// per-phase model field of its own (the assistant binary is a single
/// engine-wide setting), so there is nothing yet to override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverrides {
    pub max_iterations: Option<u32>,
    pub checkpoint: Option<bool>,
    pub gate_type: Option<GateType>,
    pub quality_checks: Option<Vec<QualityCheck>>,
    pub loop_spec: Option<LoopSpec>,
}

/// A pure predicate over a variable snapshot, evaluated to decide whether a
/// phase or loop target should run. Deliberately minimal: equality and
/// truthiness checks against a named variable, nothing more elaborate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Predicate {
    VarTruthy(String),
    VarEquals(String, serde_json::Value),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn evaluate(&self, snapshot: &IndexMap<String, serde_json::Value>) -> bool {
        match self {
            Predicate::VarTruthy(name) => snapshot.get(name).map(is_truthy).unwrap_or(false),
            Predicate::VarEquals(name, value) => snapshot.get(name) == Some(value),
            Predicate::Not(inner) => !inner.evaluate(snapshot),
            Predicate::And(preds) => preds.iter().all(|p| p.evaluate(snapshot)),
            Predicate::Or(preds) => preds.iter().any(|p| p.evaluate(snapshot)),
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Where a workflow-level variable gets its value from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VariableSource {
    Static(serde_json::Value),
    Env(String),
    Script { command: String, args: Vec<String> },
    Api(serde_json::Value),
    PromptFragment(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVariable {
    pub name: String,
    pub source: VariableSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub kind: String,
    pub config: serde_json::Value,
}

/// The reusable template: an ordered set of phases plus the variables and
/// triggers that parameterize them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub phases: Vec<WorkflowPhase>,
    pub variables: Vec<WorkflowVariable>,
    pub triggers: Vec<WorkflowTrigger>,
}

impl Workflow {
    pub fn phase(&self, id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.phase_template_id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum PhaseStatus {
    Pending,
    Running,
    /// A `Human`-gated phase parked waiting for external approval. Not
    /// `Pending`, so the driver won't re-select it on its own; a caller must
    /// explicitly approve it to move it to `Completed`.
    AwaitingApproval,
    Completed,
    Failed,
    Skipped,
}

/// The outcome tag an assistant subprocess reports on its structured
/// completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum AssistantOutcome {
    Success,
    Failure,
    NeedsInput,
}

/// Content produced by a phase, either inline or as a path into the
/// worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArtifactContent {
    Inline(String),
    Path(std::path::PathBuf),
}

/// The structured record an assistant subprocess emits on stdout at the end
/// of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantCompletion {
    pub outcome: AssistantOutcome,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub artifact: Option<ArtifactContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl RunMetrics {
    pub fn accumulate(&mut self, completion: &AssistantCompletion) {
        self.tokens_in += completion.tokens_in;
        self.tokens_out += completion.tokens_out;
        self.cost_usd += completion.cost_usd;
    }
}

/// Per-phase state within one [`WorkflowRun`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub iteration: u32,
    pub retried: bool,
    pub metrics: RunMetrics,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            iteration: 0,
            retried: false,
            metrics: RunMetrics::default(),
            output: None,
            error: None,
        }
    }
}

/// One execution of a [`Workflow`] against a specific [`TaskContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub context: TaskContext,
    pub status: RunStatus,
    pub current_phase: Option<PhaseId>,
    pub phases: IndexMap<PhaseId, PhaseRecord>,
    pub variables: IndexMap<String, serde_json::Value>,
    pub metrics: RunMetrics,
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Materialize a fresh run in `Pending`, one [`PhaseRecord`] per phase
    /// in the workflow's declared order.
    pub fn new(workflow: &Workflow, context: TaskContext) -> Self {
        let phases = workflow
            .phases
            .iter()
            .map(|p| (p.phase_template_id.clone(), PhaseRecord::pending()))
            .collect();
        Self {
            id: RunId::new(),
            workflow_id: workflow.id.clone(),
            context,
            status: RunStatus::Pending,
            current_phase: None,
            phases,
            variables: IndexMap::new(),
            metrics: RunMetrics::default(),
            error: None,
        }
    }

    /// The run is complete iff every phase is `Completed` or `Skipped`.
    pub fn all_phases_terminal_success(&self) -> bool {
        self.phases
            .values()
            .all(|p| matches!(p.status, PhaseStatus::Completed | PhaseStatus::Skipped))
    }

    pub fn running_phase_count(&self) -> usize {
        self.phases
            .values()
            .filter(|p| p.status == PhaseStatus::Running)
            .count()
    }

    /// Sum of all per-phase metrics; should always equal `self.metrics`.
    pub fn recomputed_metrics(&self) -> RunMetrics {
        let mut totals = RunMetrics::default();
        for record in self.phases.values() {
            totals.tokens_in += record.metrics.tokens_in;
            totals.tokens_out += record.metrics.tokens_out;
            totals.cost_usd += record.metrics.cost_usd;
        }
        totals
    }
}

/// Resolve the effective iteration ceiling for a phase: per-run override,
/// else the template's own value, else [`DEFAULT_MAX_ITERATIONS`].
pub fn effective_max_iterations(overrides: &PhaseOverrides, template: &PhaseTemplate) -> u32 {
    overrides
        .max_iterations
        .or(template.max_iterations)
        .unwrap_or(DEFAULT_MAX_ITERATIONS)
}

/// Resolve the effective gate type for a phase: per-run override, else the
/// template's own value.
pub fn effective_gate_type(overrides: &PhaseOverrides, template: &PhaseTemplate) -> GateType {
    overrides.gate_type.unwrap_or(template.gate_type)
}

/// Resolve whether a phase checkpoints: per-run override, else the
/// template's own value.
pub fn effective_checkpoint(overrides: &PhaseOverrides, template: &PhaseTemplate) -> bool {
    overrides.checkpoint.unwrap_or(template.checkpoint)
}

/// Resolve the effective quality checks for a phase: a per-run override
/// replaces the template's list wholesale rather than merging with it.
pub fn effective_quality_checks<'a>(overrides: &'a PhaseOverrides, template: &'a PhaseTemplate) -> &'a [QualityCheck] {
    overrides.quality_checks.as_deref().unwrap_or(&template.quality_checks)
}

/// Resolve the effective loop spec for a phase: per-run override, else the
/// template's own value.
pub fn effective_loop_spec<'a>(overrides: &'a PhaseOverrides, template: &'a PhaseTemplate) -> Option<&'a LoopSpec> {
    overrides.loop_spec.as_ref().or(template.loop_spec.as_ref())
}

/// Look up a [`PhaseTemplate`] by id from a flat registry.
pub fn find_template<'a>(
    templates: &'a HashMap<PhaseId, PhaseTemplate>,
    id: &str,
) -> Option<&'a PhaseTemplate> {
    templates.get(id)
}
