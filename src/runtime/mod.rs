//! Graph execution: drives nodes, applies state updates, evaluates
//! transitions in declared order, and streams events.
//!
//! The model is single-writer and cooperative. Steps run sequentially; the
//! runtime yields only at action boundaries and suspension points.
//! Cancellation and the whole-workflow timeout are checkpointed at step
//! boundaries; inside an action they are advisory.

pub mod events;
pub mod inputs;
pub mod loops;
pub mod state;

pub use events::{CollectorSink, Event, EventSink, ExecutionStatus, JsonlSink};
pub use state::{
    is_reserved_key, sanitize_outputs, WorkflowState, CONTROL_KEY_WHITELIST, RESERVED_STATE_KEYS,
};

use crate::actions::{Action, ActionRegistry, ActionResult, ExecutionContext, StepOutcome};
use crate::error::WorkflowError;
use crate::evaluator::{is_truthy, stringify, Evaluator};
use crate::graph::{FinallyStep, Graph, Guard, Node, NodeKind, CLEANUP_NODE, END_NODE};
use crate::schema::{RetryConfig, StepConfig};
use events::now_timestamp;
use inputs::coerce_inputs;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    /// Whole-workflow timeout, enforced at step boundaries.
    pub workflow_timeout: Option<Duration>,
    /// Default per-step timeout when a step declares none.
    pub step_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SuspensionRequest {
    pub step_id: String,
    pub suspension_type: String,
    pub prompt: String,
    pub options: Option<Vec<String>>,
    pub default: Option<Value>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: ExecutionStatus,
    pub final_state: Map<String, Value>,
    /// Per-step outputs, plus `workflow` for explicit exit outputs.
    pub outputs: Map<String, Value>,
    /// User step ids in execution order, including skipped steps.
    pub step_sequence: Vec<String>,
    pub error: Option<String>,
    pub suspension: Option<SuspensionRequest>,
    /// Node to re-enter on resume; set only while suspended.
    pub resume_node: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    pub fn suspended(&self) -> bool {
        self.status == ExecutionStatus::Suspended
    }
}

enum StepFlow {
    Continue,
    Suspend(SuspensionRequest),
    Interrupted,
}

pub struct WorkflowRunner {
    registry: ActionRegistry,
    exec: ExecutionContext,
    options: RunOptions,
    sinks: Vec<Box<dyn EventSink>>,
}

impl WorkflowRunner {
    pub fn new(registry: ActionRegistry, exec: ExecutionContext) -> Self {
        Self {
            registry,
            exec,
            options: RunOptions::default(),
            sinks: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Handle for external interruption; cancellation is observed at step
    /// boundaries and advisorily inside actions.
    pub fn cancellation_token(&self) -> crate::actions::CancellationToken {
        self.exec.cancel.clone()
    }

    pub fn run(
        &mut self,
        graph: &Graph,
        provided_inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        let coerced = coerce_inputs(&graph.input_definitions, provided_inputs)?;

        let mut initial = Map::new();
        initial.insert("inputs".to_string(), Value::Object(coerced));
        initial.insert("env".to_string(), Value::Object(graph.env.clone()));
        initial.insert("steps".to_string(), json!({}));
        let state = WorkflowState::new(initial);

        let run_id = self.options.run_id.clone().unwrap_or_else(|| {
            format!("{}-{}", graph.name, chrono::Utc::now().timestamp_millis())
        });
        self.emit(&Event::WorkflowStart {
            workflow: graph.name.clone(),
            run_id: run_id.clone(),
            timestamp: now_timestamp(),
        });

        self.drive(graph, state, graph.entry.clone(), run_id, Vec::new())
    }

    /// Resume a suspended run with caller-supplied input. The input lands in
    /// `__resume_data[step_id]` and the suspended action is re-invoked.
    pub fn resume(
        &mut self,
        graph: &Graph,
        prior: ExecutionResult,
        payload: Value,
    ) -> Result<ExecutionResult, WorkflowError> {
        let Some(suspension) = prior.suspension else {
            return Err(WorkflowError::NotSuspended);
        };
        let Some(resume_node) = prior.resume_node else {
            return Err(WorkflowError::NotSuspended);
        };

        let mut state = WorkflowState::new(prior.final_state);
        let mut resume_data = state
            .get("__resume_data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        resume_data.insert(suspension.step_id.clone(), payload);
        state.insert("__resume_data", Value::Object(resume_data));

        self.drive(graph, state, resume_node, prior.run_id, prior.step_sequence)
    }

    fn drive(
        &mut self,
        graph: &Graph,
        mut state: WorkflowState,
        mut current: String,
        run_id: String,
        mut step_sequence: Vec<String>,
    ) -> Result<ExecutionResult, WorkflowError> {
        let deadline = self.options.workflow_timeout.map(|t| Instant::now() + t);
        let mut terminal_override: Option<(ExecutionStatus, String)> = None;
        let mut last_error: Option<String> = None;

        loop {
            if current == END_NODE {
                break;
            }

            // Cancellation and workflow timeout are checkpointed at step
            // boundaries; cleanup still runs.
            if terminal_override.is_none() {
                let tripped = if self.exec.cancel.is_cancelled() {
                    Some((
                        ExecutionStatus::Interrupted,
                        "workflow interrupted".to_string(),
                    ))
                } else if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                    let seconds = self
                        .options
                        .workflow_timeout
                        .map(|t| t.as_secs())
                        .unwrap_or_default();
                    Some((
                        ExecutionStatus::Timeout,
                        format!("workflow timed out after {seconds}s"),
                    ))
                } else {
                    None
                };
                if let Some(tripped) = tripped {
                    terminal_override = Some(tripped);
                    if current != CLEANUP_NODE {
                        current = CLEANUP_NODE.to_string();
                    }
                    continue;
                }
            }

            let node = graph.node(&current).ok_or_else(|| {
                WorkflowError::compilation(format!("graph has no node `{current}`"), None)
            })?;

            let outcome = match &node.kind {
                NodeKind::End => break,
                NodeKind::Action {
                    step,
                    step_id,
                    action_type,
                    has_failure_handler,
                } => self.execute_user_step(
                    step,
                    step_id,
                    action_type,
                    !has_failure_handler,
                    deadline,
                    &mut state,
                    &run_id,
                    &mut step_sequence,
                ),
                NodeKind::LoopBody {
                    step,
                    action_type,
                    plan,
                } => self.execute_user_step(
                    step,
                    &plan.body_node(),
                    action_type,
                    // Loop failures are routed by the advance node, not the
                    // workflow-failed flag.
                    false,
                    deadline,
                    &mut state,
                    &run_id,
                    &mut step_sequence,
                ),
                NodeKind::Condition {
                    expression,
                    body_id,
                } => self.run_condition(expression, body_id, &mut state, &run_id, &mut step_sequence),
                NodeKind::LoopInit(plan) => {
                    loops::run_init(plan, &mut state, &self.exec).map(|_| StepFlow::Continue)
                }
                NodeKind::LoopCheck(plan) => {
                    loops::run_check(plan, &mut state).map(|_| StepFlow::Continue)
                }
                NodeKind::LoopAdvance(plan) => {
                    loops::run_advance(plan, &mut state, &self.exec).map(|_| StepFlow::Continue)
                }
                NodeKind::LoopFinalize(plan) => {
                    loops::run_finalize(plan, &mut state).map(|_| StepFlow::Continue)
                }
                NodeKind::Cleanup { finally_steps } => self
                    .run_cleanup(finally_steps, &mut state, &run_id)
                    .map(|_| StepFlow::Continue),
            };

            match outcome {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Suspend(request)) => {
                    return Ok(ExecutionResult {
                        run_id,
                        status: ExecutionStatus::Suspended,
                        outputs: extract_outputs(&state),
                        final_state: state.into_values(),
                        step_sequence,
                        error: None,
                        suspension: Some(request),
                        resume_node: Some(current),
                    });
                }
                Ok(StepFlow::Interrupted) => {
                    terminal_override = Some((
                        ExecutionStatus::Interrupted,
                        "workflow interrupted".to_string(),
                    ));
                    current = CLEANUP_NODE.to_string();
                    continue;
                }
                Err(WorkflowError::Interrupted) => {
                    terminal_override = Some((
                        ExecutionStatus::Interrupted,
                        "workflow interrupted".to_string(),
                    ));
                    current = CLEANUP_NODE.to_string();
                    continue;
                }
                Err(err) if current == CLEANUP_NODE => {
                    // Cleanup failures never mask the terminal status.
                    last_error.get_or_insert(err.to_string());
                    current = END_NODE.to_string();
                    continue;
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    state.insert("__workflow_failed", json!(true));
                    current = CLEANUP_NODE.to_string();
                    continue;
                }
            }

            current = select_transition(node, &state)?;
        }

        let status = match &terminal_override {
            Some((status, message)) => {
                last_error.get_or_insert(message.clone());
                *status
            }
            None if state.flag("__workflow_failed") => ExecutionStatus::Failed,
            None => ExecutionStatus::Completed,
        };
        let error = last_error.or_else(|| {
            state
                .get("__error_message")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        self.emit(&Event::WorkflowEnd {
            workflow: graph.name.clone(),
            run_id: run_id.clone(),
            status,
            error: error.clone(),
            timestamp: now_timestamp(),
        });

        Ok(ExecutionResult {
            run_id,
            status,
            outputs: extract_outputs(&state),
            final_state: state.into_values(),
            step_sequence,
            error,
            suspension: None,
            resume_node: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_user_step(
        &mut self,
        step: &StepConfig,
        node_name: &str,
        action_type: &str,
        raise_failed_flag: bool,
        workflow_deadline: Option<Instant>,
        state: &mut WorkflowState,
        run_id: &str,
        step_sequence: &mut Vec<String>,
    ) -> Result<StepFlow, WorkflowError> {
        let action = self.registry.get(action_type).ok_or_else(|| {
            WorkflowError::UnknownAction {
                action_type: action_type.to_string(),
                suggestion: self.registry.suggest(action_type),
            }
        })?;

        let mut exec = self.exec.clone();
        exec.step_timeout = step
            .timeout
            .map(Duration::from_secs_f64)
            .or(self.options.step_timeout);
        // The workflow deadline caps the step budget so a long-running
        // action cannot outlive the whole-workflow timeout.
        if let Some(deadline) = workflow_deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            exec.step_timeout = Some(match exec.step_timeout {
                Some(step_budget) => step_budget.min(remaining),
                None => remaining,
            });
        }

        self.emit(&Event::StepStart {
            run_id: run_id.to_string(),
            step_id: node_name.to_string(),
            timestamp: now_timestamp(),
        });
        let started = Instant::now();

        let context = state.evaluation_context();
        let result = match self.run_with_retries(step, node_name, action.as_ref(), &context, &exec)
        {
            Ok(result) => result,
            Err(WorkflowError::Interrupted) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                state.record_step_result(
                    node_name,
                    StepOutcome::Failure,
                    Map::new(),
                    Some("interrupted"),
                    Some("interrupted"),
                );
                step_sequence.push(node_name.to_string());
                self.emit(&Event::StepEnd {
                    run_id: run_id.to_string(),
                    step_id: node_name.to_string(),
                    outcome: "failure".to_string(),
                    error: Some("interrupted".to_string()),
                    duration_ms,
                    timestamp: now_timestamp(),
                });
                return Ok(StepFlow::Interrupted);
            }
            Err(err) => Err(err)?,
        };

        // Resume data is consumed by the step it was addressed to.
        if result.outcome != StepOutcome::Suspended {
            if let Some(Value::Object(mut resume)) = state.remove("__resume_data") {
                resume.remove(node_name);
                if !resume.is_empty() {
                    state.insert("__resume_data", Value::Object(resume));
                }
            }
        }

        let sanitized = sanitize_outputs(&result.outputs);
        state.record_step_result(
            node_name,
            result.outcome,
            sanitized,
            result.error.as_deref(),
            result.error_type.as_deref(),
        );

        // Whitelisted control keys flow from raw outputs into top-level
        // state; this is how control actions steer the workflow.
        for key in CONTROL_KEY_WHITELIST {
            if let Some(value) = result.outputs.get(*key) {
                state.insert(key.to_string(), value.clone());
            }
        }
        if let Some(hint) = &result.next_hint {
            state.insert("__next", json!(hint));
        }

        if result.outcome == StepOutcome::Failure && raise_failed_flag {
            state.insert("__workflow_failed", json!(true));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        step_sequence.push(node_name.to_string());
        self.emit(&Event::StepEnd {
            run_id: run_id.to_string(),
            step_id: node_name.to_string(),
            outcome: result.outcome.as_str().to_string(),
            error: result.error.clone(),
            duration_ms,
            timestamp: now_timestamp(),
        });

        if result.outcome == StepOutcome::Suspended {
            return Ok(StepFlow::Suspend(suspension_request(node_name, &result)));
        }
        Ok(StepFlow::Continue)
    }

    fn run_with_retries(
        &self,
        step: &StepConfig,
        node_name: &str,
        action: &dyn Action,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let retry = step.retry.clone();
        let max_attempts = retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);

        let mut attempt = 1;
        loop {
            let result = match action.execute(step, context, exec) {
                Ok(result) => result,
                Err(WorkflowError::Interrupted) => return Err(WorkflowError::Interrupted),
                Err(err) => {
                    let kind = err.kind().to_string();
                    let mut failure = ActionResult::failure(err.to_string(), kind);
                    failure.outputs = Map::new();
                    failure
                }
            };

            if !result.is_failure() || attempt >= max_attempts {
                return Ok(result);
            }
            let retry = retry.as_ref().expect("max_attempts > 1 implies retry");
            if !retry_allows(retry, result.error_type.as_deref()) {
                return Ok(result);
            }

            let delay = backoff_delay(retry, attempt);
            self.exec.log(
                "warning",
                &format!(
                    "step `{node_name}` attempt {attempt} failed; retrying in {delay:.2}s"
                ),
            );
            if !sleep_cancellable(Duration::from_secs_f64(delay), exec) {
                return Err(WorkflowError::Interrupted);
            }
            attempt += 1;
        }
    }

    fn run_condition(
        &mut self,
        expression: &str,
        body_id: &str,
        state: &mut WorkflowState,
        run_id: &str,
        step_sequence: &mut Vec<String>,
    ) -> Result<StepFlow, WorkflowError> {
        let mut evaluator = Evaluator::new(state.evaluation_context());
        if let Some(workspace) = &self.exec.workspace {
            evaluator = evaluator.with_workspace(workspace.clone());
        }

        match evaluator.evaluate_condition(expression) {
            Ok(true) => {
                state.insert("__condition_met", json!(true));
            }
            Ok(false) => {
                state.insert("__condition_met", json!(false));
                self.emit(&Event::StepStart {
                    run_id: run_id.to_string(),
                    step_id: body_id.to_string(),
                    timestamp: now_timestamp(),
                });
                state.record_step_result(body_id, StepOutcome::Skipped, Map::new(), None, None);
                step_sequence.push(body_id.to_string());
                self.emit(&Event::StepEnd {
                    run_id: run_id.to_string(),
                    step_id: body_id.to_string(),
                    outcome: "skipped".to_string(),
                    error: None,
                    duration_ms: 0,
                    timestamp: now_timestamp(),
                });
            }
            Err(err) => {
                state.insert("__condition_met", json!(false));
                state.record_step_result(
                    body_id,
                    StepOutcome::Failure,
                    Map::new(),
                    Some(&err.to_string()),
                    Some("expression"),
                );
                state.insert("__workflow_failed", json!(true));
            }
        }
        Ok(StepFlow::Continue)
    }

    /// Run finally steps in declared order with error isolation: one
    /// failing finally step is recorded but does not abort the rest.
    fn run_cleanup(
        &mut self,
        finally_steps: &[FinallyStep],
        state: &mut WorkflowState,
        run_id: &str,
    ) -> Result<(), WorkflowError> {
        let mut warnings: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();

        // Finally steps run on every terminal path, including interrupt;
        // they get a fresh cancellation token so a cancelled run cannot
        // pre-empt its own cleanup.
        let mut cleanup_exec = self.exec.clone();
        cleanup_exec.cancel = crate::actions::CancellationToken::new();

        for finally in finally_steps {
            let Some(action) = self.registry.get(&finally.action_type) else {
                errors.push(json!(format!(
                    "finally step `{}` uses unknown action `{}`",
                    finally.step_id, finally.action_type
                )));
                continue;
            };

            self.emit(&Event::StepStart {
                run_id: run_id.to_string(),
                step_id: finally.step_id.clone(),
                timestamp: now_timestamp(),
            });
            let started = Instant::now();
            let context = state.evaluation_context();

            let (outcome, outputs, error, error_type) =
                match action.execute(&finally.step, &context, &cleanup_exec) {
                    Ok(result) => {
                        if result.outcome != StepOutcome::Success {
                            warnings.push(json!(format!(
                                "finally step `{}` completed with outcome {}",
                                finally.step_id, result.outcome
                            )));
                        }
                        (
                            result.outcome,
                            sanitize_outputs(&result.outputs),
                            result.error,
                            result.error_type,
                        )
                    }
                    Err(err) => {
                        errors.push(json!(format!(
                            "finally step `{}` failed: {err}",
                            finally.step_id
                        )));
                        (
                            StepOutcome::Failure,
                            Map::new(),
                            Some(err.to_string()),
                            Some(err.kind().to_string()),
                        )
                    }
                };

            state.record_step_result(
                &finally.step_id,
                outcome,
                outputs,
                error.as_deref(),
                error_type.as_deref(),
            );
            self.emit(&Event::StepEnd {
                run_id: run_id.to_string(),
                step_id: finally.step_id.clone(),
                outcome: outcome.as_str().to_string(),
                error,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: now_timestamp(),
            });
        }

        state.insert("__cleanup_complete", json!(true));
        state.insert("__cleanup_warnings", Value::Array(warnings));
        state.insert("__cleanup_errors", Value::Array(errors));
        Ok(())
    }

    fn emit(&mut self, event: &Event) {
        for sink in &mut self.sinks {
            sink.emit(event);
        }
    }
}

fn select_transition(node: &Node, state: &WorkflowState) -> Result<String, WorkflowError> {
    for transition in &node.transitions {
        let matches = match &transition.guard {
            Guard::Default => true,
            Guard::StateEquals { key, value } => state.get(key) == Some(value),
            Guard::CleanupPriority => {
                state.flag("__workflow_exit") || state.flag("__workflow_failed")
            }
        };
        if matches {
            return Ok(transition.target.clone());
        }
    }
    Err(WorkflowError::compilation(
        format!("node `{}` has no matching transition", node.name),
        None,
    ))
}

fn suspension_request(step_id: &str, result: &ActionResult) -> SuspensionRequest {
    let outputs = &result.outputs;
    SuspensionRequest {
        step_id: step_id.to_string(),
        suspension_type: outputs
            .get("type")
            .or_else(|| outputs.get("suspension_type"))
            .and_then(Value::as_str)
            .unwrap_or("input")
            .to_string(),
        prompt: outputs
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or("user input required")
            .to_string(),
        options: outputs.get("options").and_then(Value::as_array).map(|items| {
            items.iter().map(stringify).collect()
        }),
        default: outputs.get("default").cloned(),
        timeout: outputs.get("timeout").and_then(Value::as_u64),
    }
}

fn extract_outputs(state: &WorkflowState) -> Map<String, Value> {
    let mut outputs = Map::new();
    if let Some(Value::Object(steps)) = state.get("steps") {
        for (step_id, entry) in steps {
            if let Some(step_outputs) = entry.get("outputs") {
                outputs.insert(step_id.clone(), step_outputs.clone());
            }
        }
    }
    if let Some(exit_outputs) = state.get("__exit_outputs") {
        if is_truthy(exit_outputs) {
            outputs.insert("workflow".to_string(), exit_outputs.clone());
        }
    }
    outputs
}

fn retry_allows(retry: &RetryConfig, error_type: Option<&str>) -> bool {
    if retry.retry_on.is_empty() {
        return true;
    }
    error_type
        .map(|kind| retry.retry_on.iter().any(|allowed| allowed == kind))
        .unwrap_or(false)
}

/// `delay_n = min(max_delay, base * multiplier^(n-1))`, with optional
/// jitter keeping the delay in [0.5, 1.0] of the computed value.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> f64 {
    let exponent = attempt.saturating_sub(1);
    let raw = retry.delay * retry.multiplier.powi(exponent as i32);
    let capped = raw.min(retry.max_delay).max(0.0);
    if !retry.jitter {
        return capped;
    }
    capped * (0.5 + 0.5 * random_fraction())
}

fn random_fraction() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

fn sleep_cancellable(duration: Duration, exec: &ExecutionContext) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if exec.cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
    true
}
