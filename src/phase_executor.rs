//! Drives one phase of a [`WorkflowRun`] to completion: input materialization,
//! assistant invocation, quality checks, checkpointing, retry and loop
//! control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use indexmap::IndexMap;

use crate::checkpoint;
use crate::command::{CommandError, CommandRunner};
use crate::vcs::{VcsError, VcsHandle};
use crate::workflow::{
    effective_checkpoint, effective_gate_type, effective_loop_spec, effective_max_iterations,
    effective_quality_checks, AssistantCompletion, AssistantOutcome, ArtifactContent, GateType,
    OnFailure, PhaseId, PhaseStatus, PhaseTemplate, PromptSource, QualityCheck, VariableSource,
    Workflow, WorkflowRun, WorkflowVariable,
};

#[derive(Debug)]
pub enum PhaseError {
    /// A declared input variable had no source at materialization time.
    MissingVariable { phase: PhaseId, var_name: String },
    Assistant(CommandError),
    /// The assistant's stdout didn't parse as a completion record.
    MalformedCompletion { phase: PhaseId, message: String },
    QualityCheckFailed { phase: PhaseId, check: String, message: String },
    /// An `Ai`-gated phase's evaluator agent rejected the completion.
    GateRejected { phase: PhaseId, message: String },
    Vcs(VcsError),
    Cancelled { phase: PhaseId },
}

impl std::fmt::Display for PhaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVariable { phase, var_name } => {
                write!(f, "phase {phase:?} is missing required variable {var_name:?}")
            }
            Self::Assistant(e) => write!(f, "assistant invocation failed: {e}"),
            Self::MalformedCompletion { phase, message } => {
                write!(f, "phase {phase:?} assistant completion was malformed: {message}")
            }
            Self::QualityCheckFailed { phase, check, message } => {
                write!(f, "phase {phase:?} quality check {check:?} failed: {message}")
            }
            Self::GateRejected { phase, message } => {
                write!(f, "phase {phase:?} was rejected by its AI gate: {message}")
            }
            Self::Vcs(e) => write!(f, "{e}"),
            Self::Cancelled { phase } => write!(f, "phase {phase:?} was cancelled"),
        }
    }
}

impl std::error::Error for PhaseError {}

impl From<VcsError> for PhaseError {
    fn from(e: VcsError) -> Self {
        Self::Vcs(e)
    }
}

/// What happened to a phase after one call to [`execute_phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Skipped,
    /// A `Human`-gated phase has produced nothing yet and is waiting on
    /// external resolution; the run driver suspends the run to `Paused`.
    AwaitingHuman,
    /// Failed with no configured recovery; the run driver marks it `Failed`.
    Failed,
    /// Failed, but a `retry_from_phase` target should be re-run from
    /// `Pending`.
    RetryFrom(PhaseId),
    /// Succeeded, but its own loop condition says to re-run `target`.
    LoopTo(PhaseId),
}

/// Everything [`execute_phase`] needs beyond the run and workflow state:
/// the process-spawning capability, the worktree it runs in, and where the
/// assistant binary lives.
pub struct PhaseExecutorContext<'a> {
    pub runner: Arc<dyn CommandRunner>,
    pub handle: &'a VcsHandle,
    pub assistant_binary: String,
    pub assistant_timeout: Duration,
    pub commit_prefix: String,
}

/// Run `phase_id` to a terminal (for this call) outcome.
///
/// `cancel` is polled before each assistant iteration; a pending message on
/// it aborts the phase with [`PhaseOutcome::Failed`] and a
/// [`PhaseError::Cancelled`] recorded on the phase.
pub fn execute_phase(
    ctx: &PhaseExecutorContext,
    run: &mut WorkflowRun,
    workflow: &Workflow,
    templates: &HashMap<PhaseId, PhaseTemplate>,
    phase_id: &str,
    cancel: &Receiver<()>,
) -> Result<PhaseOutcome, PhaseError> {
    let workflow_phase = workflow
        .phase(phase_id)
        .unwrap_or_else(|| panic!("phase {phase_id:?} is not declared on workflow {:?}", workflow.id));
    let template = templates
        .get(phase_id)
        .unwrap_or_else(|| panic!("no template registered for phase {phase_id:?}"));

    let gate_type = effective_gate_type(&workflow_phase.overrides, template);

    if gate_type == GateType::Skip {
        mark(run, phase_id, PhaseStatus::Skipped, None, None);
        return Ok(PhaseOutcome::Skipped);
    }

    if gate_type == GateType::Human {
        mark(run, phase_id, PhaseStatus::AwaitingApproval, None, None);
        return Ok(PhaseOutcome::AwaitingHuman);
    }

    mark(run, phase_id, PhaseStatus::Running, None, None);

    let inputs = match materialize_inputs(run, workflow, template) {
        Ok(inputs) => inputs,
        Err(e) => {
            record_failure(run, phase_id, &e.to_string());
            return handle_failure(run, template, phase_id, e);
        }
    };

    let max_iterations = effective_max_iterations(&workflow_phase.overrides, template);
    let mut last_completion: Option<AssistantCompletion> = None;

    for iteration in 1..=max_iterations.max(1) {
        if cancel.try_recv().is_ok() {
            record_failure(run, phase_id, "cancelled");
            return Err(PhaseError::Cancelled { phase: phase_id.to_string() });
        }

        record_iteration(run, phase_id, iteration);

        let prior = last_completion.as_ref();
        let completion = match invoke_assistant(ctx, template, &inputs, prior) {
            Ok(c) => c,
            Err(e) => {
                record_failure(run, phase_id, &e.to_string());
                return handle_failure(run, template, phase_id, e);
            }
        };

        run.metrics.accumulate(&completion);
        if let Some(record) = run.phases.get_mut(phase_id) {
            record.metrics.accumulate(&completion);
        }

        match completion.outcome {
            AssistantOutcome::Success => {
                last_completion = Some(completion);
                break;
            }
            AssistantOutcome::NeedsInput if iteration < max_iterations => {
                last_completion = Some(completion);
                continue;
            }
            AssistantOutcome::NeedsInput | AssistantOutcome::Failure => {
                let message = format!("assistant reported {:?} on iteration {iteration}", completion.outcome);
                record_failure(run, phase_id, &message);
                return handle_failure(
                    run,
                    template,
                    phase_id,
                    PhaseError::MalformedCompletion { phase: phase_id.to_string(), message },
                );
            }
        }
    }

    let completion = last_completion.expect("loop always sets last_completion before breaking or returning");

    if gate_type == GateType::Ai {
        if let Err(e) = invoke_ai_gate(ctx, template, &completion) {
            record_failure(run, phase_id, &e.to_string());
            return handle_failure(run, template, phase_id, e);
        }
    }

    if let Err(e) = run_quality_checks(ctx, phase_id, effective_quality_checks(&workflow_phase.overrides, template)) {
        record_failure(run, phase_id, &e.to_string());
        return handle_failure(run, template, phase_id, e);
    }

    if effective_checkpoint(&workflow_phase.overrides, template) {
        let message = format!("checkpoint for {}", template.display_name);
        if let Err(e) = checkpoint::record_checkpoint(
            ctx.handle,
            &run.context.task_id,
            phase_id,
            &ctx.commit_prefix,
            &message,
        ) {
            record_failure(run, phase_id, &e.to_string());
            return Err(e.into());
        }
    }

    let output_value = completion
        .artifact
        .as_ref()
        .and_then(|a| artifact_to_value(a));
    if let Some(output) = &template.output {
        run.variables.insert(output.var_name.clone(), output_value.clone().unwrap_or(serde_json::Value::Null));
    }

    mark(run, phase_id, PhaseStatus::Completed, output_value, None);

    if let Some(loop_spec) = effective_loop_spec(&workflow_phase.overrides, template) {
        let loop_iterations = run
            .phases
            .get(&loop_spec.target)
            .map(|r| r.iteration)
            .unwrap_or(0);
        if loop_spec.condition.evaluate(&run.variables) && loop_iterations < loop_spec.max_iterations {
            if let Some(target) = run.phases.get_mut(&loop_spec.target) {
                target.status = PhaseStatus::Pending;
            }
            return Ok(PhaseOutcome::LoopTo(loop_spec.target.clone()));
        }
    }

    Ok(PhaseOutcome::Completed)
}

/// At most one retry per failing phase per run: if this phase has already
/// been retried once, a further failure propagates instead of looping.
fn handle_failure(run: &WorkflowRun, template: &PhaseTemplate, phase_id: &str, error: PhaseError) -> Result<PhaseOutcome, PhaseError> {
    let already_retried = run.phases.get(phase_id).map(|r| r.retried).unwrap_or(false);
    if !already_retried {
        if let Some(retry_target) = &template.retry_from_phase {
            return Ok(PhaseOutcome::RetryFrom(retry_target.clone()));
        }
    }
    Err(error)
}

fn mark(
    run: &mut WorkflowRun,
    phase_id: &str,
    status: PhaseStatus,
    output: Option<serde_json::Value>,
    error: Option<String>,
) {
    if let Some(record) = run.phases.get_mut(phase_id) {
        record.status = status;
        if output.is_some() {
            record.output = output;
        }
        record.error = error;
    }
    if status == PhaseStatus::Running {
        run.current_phase = Some(phase_id.to_string());
    } else if run.current_phase.as_deref() == Some(phase_id) {
        run.current_phase = None;
    }
}

fn record_iteration(run: &mut WorkflowRun, phase_id: &str, iteration: u32) {
    if let Some(record) = run.phases.get_mut(phase_id) {
        record.iteration = iteration;
    }
}

fn record_failure(run: &mut WorkflowRun, phase_id: &str, message: &str) {
    mark(run, phase_id, PhaseStatus::Failed, None, Some(message.to_string()));
}

fn artifact_to_value(artifact: &crate::workflow::ArtifactContent) -> Option<serde_json::Value> {
    match artifact {
        crate::workflow::ArtifactContent::Inline(s) => Some(serde_json::Value::String(s.clone())),
        crate::workflow::ArtifactContent::Path(p) => Some(serde_json::Value::String(p.display().to_string())),
    }
}

/// Resolve `template.input_vars` against, in order: the run's variable
/// snapshot, prior completed phases' bound outputs (already folded into
/// that same snapshot by the run driver), and the workflow's own declared
/// variable sources. A variable with none of the three is a hard failure —
/// the assistant is never invoked with a missing required input.
fn materialize_inputs(
    run: &WorkflowRun,
    workflow: &Workflow,
    template: &PhaseTemplate,
) -> Result<IndexMap<String, serde_json::Value>, PhaseError> {
    let mut resolved = IndexMap::new();
    for var_name in &template.input_vars {
        if let Some(value) = run.variables.get(var_name) {
            resolved.insert(var_name.clone(), value.clone());
            continue;
        }
        if let Some(value) = resolve_workflow_variable(workflow, var_name) {
            resolved.insert(var_name.clone(), value);
            continue;
        }
        return Err(PhaseError::MissingVariable {
            phase: template.id.clone(),
            var_name: var_name.clone(),
        });
    }
    Ok(resolved)
}

fn resolve_workflow_variable(workflow: &Workflow, var_name: &str) -> Option<serde_json::Value> {
    let declared: &WorkflowVariable = workflow.variables.iter().find(|v| v.name == var_name)?;
    match &declared.source {
        VariableSource::Static(value) => Some(value.clone()),
        VariableSource::Env(key) => std::env::var(key).ok().map(serde_json::Value::String),
        VariableSource::PromptFragment(text) => Some(serde_json::Value::String(text.clone())),
        // Script/Api sources require a process spawn or network call the
        // caller must provide ahead of time; this layer only resolves what
        // it can from static state.
        VariableSource::Script { .. } | VariableSource::Api(_) => None,
    }
}

fn render_prompt(template: &PhaseTemplate, inputs: &IndexMap<String, serde_json::Value>) -> Result<String, PhaseError> {
    let source = match &template.prompt {
        PromptSource::Embedded(text) | PromptSource::Inline(text) => text.clone(),
        PromptSource::File(path) => std::fs::read_to_string(path).map_err(|e| PhaseError::MalformedCompletion {
            phase: template.id.clone(),
            message: format!("reading prompt file {}: {e}", path.display()),
        })?,
    };

    let mut env = minijinja::Environment::new();
    env.add_template("prompt", &source).map_err(|e| PhaseError::MalformedCompletion {
        phase: template.id.clone(),
        message: format!("invalid prompt template: {e}"),
    })?;
    let tmpl = env.get_template("prompt").expect("just added");
    let ctx = minijinja::Value::from_serialize(inputs);
    tmpl.render(ctx).map_err(|e| PhaseError::MalformedCompletion {
        phase: template.id.clone(),
        message: format!("rendering prompt: {e}"),
    })
}

fn invoke_assistant(
    ctx: &PhaseExecutorContext,
    template: &PhaseTemplate,
    inputs: &IndexMap<String, serde_json::Value>,
    prior: Option<&AssistantCompletion>,
) -> Result<AssistantCompletion, PhaseError> {
    let mut prompt = render_prompt(template, inputs)?;
    if let Some(prior) = prior {
        if let Some(crate::workflow::ArtifactContent::Inline(text)) = &prior.artifact {
            prompt.push_str("\n\n---\nPrevious iteration output:\n");
            prompt.push_str(text);
        }
    }

    let output = ctx
        .runner
        .run_with_stdin(
            ctx.handle.work_dir(),
            &ctx.assistant_binary,
            &["--prompt-stdin"],
            &prompt,
            ctx.assistant_timeout,
        )
        .map_err(PhaseError::Assistant)?;

    parse_completion(&output, &template.id)
}

/// An `Ai`-gated phase's completion is not final on its own: a second
/// assistant invocation, framed as an evaluator, must also report `success`
/// before the phase is allowed to complete.
fn invoke_ai_gate(
    ctx: &PhaseExecutorContext,
    template: &PhaseTemplate,
    completion: &AssistantCompletion,
) -> Result<(), PhaseError> {
    let artifact_text = match &completion.artifact {
        Some(ArtifactContent::Inline(text)) => text.clone(),
        Some(ArtifactContent::Path(path)) => format!("(artifact at {})", path.display()),
        None => String::new(),
    };
    let prompt = format!(
        "Evaluate the output of phase {:?} below. Respond with a completion \
         record whose outcome is \"success\" to accept it, or \"failure\" to \
         reject it.\n\n{artifact_text}",
        template.display_name
    );
    let output = ctx
        .runner
        .run_with_stdin(
            ctx.handle.work_dir(),
            &ctx.assistant_binary,
            &["--prompt-stdin"],
            &prompt,
            ctx.assistant_timeout,
        )
        .map_err(PhaseError::Assistant)?;
    let verdict = parse_completion(&output, &template.id)?;
    match verdict.outcome {
        AssistantOutcome::Success => Ok(()),
        other => Err(PhaseError::GateRejected {
            phase: template.id.clone(),
            message: format!("evaluator reported {other:?}"),
        }),
    }
}

fn parse_completion(stdout: &str, phase_id: &str) -> Result<AssistantCompletion, PhaseError> {
    let last_line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PhaseError::MalformedCompletion {
            phase: phase_id.to_string(),
            message: "no output on stdout".to_string(),
        })?;
    serde_json::from_str(last_line).map_err(|e| PhaseError::MalformedCompletion {
        phase: phase_id.to_string(),
        message: e.to_string(),
    })
}

fn run_quality_checks(ctx: &PhaseExecutorContext, phase_id: &str, checks: &[QualityCheck]) -> Result<(), PhaseError> {
    for check in checks {
        if !check.enabled {
            continue;
        }
        let result = ctx.runner.run(ctx.handle.work_dir(), "sh", &["-c", &check.name]);
        if let Err(e) = result {
            match check.on_failure {
                OnFailure::Block => {
                    return Err(PhaseError::QualityCheckFailed {
                        phase: phase_id.to_string(),
                        check: check.name.clone(),
                        message: e.to_string(),
                    })
                }
                OnFailure::Warn => {
                    log::warn!("quality check {:?} failed (non-blocking): {e}", check.name);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::FakeCommandRunner;
    use crate::vcs::VcsContext;
    use crate::workflow::{PhaseOverrides, TaskContext, WorkflowPhase};

    fn sample_template(id: &str) -> PhaseTemplate {
        PhaseTemplate {
            id: id.to_string(),
            display_name: id.to_string(),
            prompt: PromptSource::Inline("do the thing".to_string()),
            input_vars: vec![],
            output: None,
            produces_artifact: false,
            checkpoint: false,
            max_iterations: Some(1),
            gate_type: GateType::Auto,
            retry_from_phase: None,
            quality_checks: vec![],
            tool_access: None,
            hooks: None,
            loop_spec: None,
        }
    }

    fn sample_workflow(id: &str) -> Workflow {
        Workflow {
            id: "wf".to_string(),
            phases: vec![WorkflowPhase {
                phase_template_id: id.to_string(),
                sequence: 0,
                depends_on: vec![],
                condition: None,
                overrides: PhaseOverrides::default(),
            }],
            variables: vec![],
            triggers: vec![],
        }
    }

    fn sample_run(workflow: &Workflow) -> WorkflowRun {
        WorkflowRun::new(
            workflow,
            TaskContext {
                task_id: "TASK-001".to_string(),
                executor_tag: String::new(),
                base_branch: "main".to_string(),
                initiative_prefix: None,
            },
        )
    }

    #[test]
    fn skip_gated_phase_never_invokes_assistant() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let mut template = sample_template("p1");
        template.gate_type = GateType::Skip;
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let outcome = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap();
        assert_eq!(outcome, PhaseOutcome::Skipped);
        assert_eq!(fake.call_count(), 0);
    }

    #[test]
    fn missing_required_variable_fails_before_assistant_invocation() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let mut template = sample_template("p1");
        template.input_vars = vec!["design_doc".to_string()];
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let err = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap_err();
        assert!(matches!(err, PhaseError::MissingVariable { .. }));
        assert_eq!(fake.call_count(), 0);
    }

    #[test]
    fn successful_assistant_completion_marks_phase_completed() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let template = sample_template("p1");
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub(
            "assistant",
            &["--prompt-stdin"],
            Ok(serde_json::to_string(&AssistantCompletion {
                outcome: AssistantOutcome::Success,
                tokens_in: 10,
                tokens_out: 20,
                cost_usd: 0.1,
                artifact: None,
            })
            .unwrap()),
        );
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let outcome = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(run.phases["p1"].status, PhaseStatus::Completed);
        assert_eq!(run.metrics.tokens_in, 10);
    }

    #[test]
    fn human_gated_phase_awaits_approval_without_invoking_assistant() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let mut template = sample_template("p1");
        template.gate_type = GateType::Human;
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let outcome = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap();
        assert_eq!(outcome, PhaseOutcome::AwaitingHuman);
        assert_eq!(run.phases["p1"].status, PhaseStatus::AwaitingApproval);
        assert_eq!(fake.call_count(), 0);
    }

    fn completion_json(outcome: AssistantOutcome) -> String {
        serde_json::to_string(&AssistantCompletion {
            outcome,
            tokens_in: 1,
            tokens_out: 1,
            cost_usd: 0.0,
            artifact: None,
        })
        .unwrap()
    }

    #[test]
    fn ai_gated_phase_completes_when_evaluator_accepts() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let mut template = sample_template("p1");
        template.gate_type = GateType::Ai;
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        // First call is the phase's own completion, second is the evaluator's verdict.
        fake.stub("assistant", &["--prompt-stdin"], Ok(completion_json(AssistantOutcome::Success)));
        fake.stub("assistant", &["--prompt-stdin"], Ok(completion_json(AssistantOutcome::Success)));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let outcome = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(run.phases["p1"].status, PhaseStatus::Completed);
    }

    #[test]
    fn ai_gated_phase_fails_when_evaluator_rejects() {
        let workflow = sample_workflow("p1");
        let mut run = sample_run(&workflow);
        let mut template = sample_template("p1");
        template.gate_type = GateType::Ai;
        let mut templates = HashMap::new();
        templates.insert("p1".to_string(), template);

        let fake = Arc::new(FakeCommandRunner::new());
        fake.stub("git", &["rev-parse", "--git-dir"], Ok(".git".to_string()));
        fake.stub("assistant", &["--prompt-stdin"], Ok(completion_json(AssistantOutcome::Success)));
        fake.stub("assistant", &["--prompt-stdin"], Ok(completion_json(AssistantOutcome::Failure)));
        let vcs = VcsContext::new("/repo", "/repo/.orc/worktrees", fake.clone(), std::collections::HashSet::new())
            .expect("fake repo check should succeed");
        let handle = vcs.handle().in_worktree("/repo/.orc/worktrees/t1");
        let ctx = PhaseExecutorContext {
            runner: fake.clone(),
            handle: &handle,
            assistant_binary: "assistant".to_string(),
            assistant_timeout: Duration::from_secs(1),
            commit_prefix: "[orc]".to_string(),
        };
        let (_tx, rx) = crossbeam_channel::unbounded();
        let err = execute_phase(&ctx, &mut run, &workflow, &templates, "p1", &rx).unwrap_err();
        assert!(matches!(err, PhaseError::GateRejected { .. }));
        assert_eq!(run.phases["p1"].status, PhaseStatus::Failed);
    }
}
