//! Control-flow actions: early exit, explicit failure, loop break, loop
//! continue, and waiting.
//!
//! These communicate with the runtime through whitelisted control keys in
//! their outputs; everything else they return is stripped like any other
//! action output.

use crate::actions::{Action, ActionResult, ExecutionContext, StepOutcome};
use crate::error::WorkflowError;
use crate::evaluator::Evaluator;
use crate::schema::StepConfig;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

fn evaluator_for(context: &Map<String, Value>, exec: &ExecutionContext) -> Evaluator {
    let mut evaluator = Evaluator::new(context.clone());
    if let Some(workspace) = &exec.workspace {
        evaluator = evaluator.with_workspace(workspace.clone());
    }
    evaluator
}

/// Exit the workflow early; finally steps still run.
pub struct ExitAction;

impl Action for ExitAction {
    fn action_type(&self) -> &str {
        "control/exit"
    }

    fn writes(&self) -> &[&str] {
        &["__workflow_exit", "__exit_status", "__exit_message", "__exit_outputs"]
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let evaluator = evaluator_for(context, exec);
        let params = &step.with_params;

        let status = params
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("success");
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("");
        let outputs = match params.get("outputs") {
            Some(value) => evaluator.resolve_all(value)?,
            None => Value::Object(Map::new()),
        };

        let mut result = Map::new();
        result.insert("__workflow_exit".to_string(), json!(true));
        result.insert("__exit_status".to_string(), json!(status));
        result.insert("__exit_message".to_string(), json!(message));
        result.insert("__exit_outputs".to_string(), outputs);
        Ok(ActionResult::success(result))
    }
}

/// Fail the workflow immediately; finally steps still run.
pub struct FailAction;

impl Action for FailAction {
    fn action_type(&self) -> &str {
        "control/fail"
    }

    fn writes(&self) -> &[&str] {
        &["__workflow_failed", "__error_message", "__error_code", "__error_details"]
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let evaluator = evaluator_for(context, exec);
        let params = &step.with_params;

        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("workflow failed")
            .to_string();
        let error_code = params
            .get("error_code")
            .and_then(Value::as_str)
            .unwrap_or("WORKFLOW_FAILURE")
            .to_string();
        let details = match params.get("details") {
            Some(value) => evaluator.resolve_all(value)?,
            None => Value::Object(Map::new()),
        };

        let mut outputs = Map::new();
        outputs.insert("__workflow_failed".to_string(), json!(true));
        outputs.insert("__error_message".to_string(), json!(message.clone()));
        outputs.insert("__error_code".to_string(), json!(error_code.clone()));
        outputs.insert("__error_details".to_string(), details);
        Ok(ActionResult {
            outputs,
            outcome: StepOutcome::Failure,
            error: Some(message),
            error_type: Some(error_code),
            next_hint: None,
        })
    }
}

/// Break out of the enclosing loop early.
pub struct BreakAction;

impl Action for BreakAction {
    fn action_type(&self) -> &str {
        "control/break"
    }

    fn writes(&self) -> &[&str] {
        &["__loop_break_requested", "__loop_break_reason", "__loop_break_item", "__loop_break_index"]
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let evaluator = evaluator_for(context, exec);
        let params = &step.with_params;

        let reason = params
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let result = match params.get("result") {
            Some(value) => evaluator.resolve_all(value)?,
            None => context
                .get("loop")
                .and_then(|frame| frame.get("item"))
                .cloned()
                .unwrap_or(Value::Null),
        };
        let index = context
            .get("loop")
            .and_then(|frame| frame.get("index0"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut outputs = Map::new();
        outputs.insert("__loop_break_requested".to_string(), json!(true));
        outputs.insert("__loop_break_reason".to_string(), json!(reason));
        outputs.insert("__loop_break_item".to_string(), result);
        outputs.insert("__loop_break_index".to_string(), index);
        Ok(ActionResult::success(outputs))
    }
}

/// Skip to the next loop iteration. The body result is reported as
/// skipped, which the advance node neither aggregates nor counts as an
/// error.
pub struct ContinueAction;

impl Action for ContinueAction {
    fn action_type(&self) -> &str {
        "control/continue"
    }

    fn execute(
        &self,
        _step: &StepConfig,
        _context: &Map<String, Value>,
        _exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        Ok(ActionResult::skipped())
    }
}

/// Wait for a fixed duration, or poll a condition until it holds.
pub struct WaitAction;

impl Action for WaitAction {
    fn action_type(&self) -> &str {
        "control/wait"
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let params = &step.with_params;
        let duration = params.get("duration").and_then(Value::as_f64);
        let until = params.get("until").and_then(Value::as_str);
        let interval = params.get("interval").and_then(Value::as_f64).unwrap_or(5.0);
        let timeout = params.get("timeout").and_then(Value::as_f64).unwrap_or(300.0);

        if duration.is_none() && until.is_none() {
            return Ok(ActionResult::failure(
                "control/wait requires either `duration` or `until`",
                "validation",
            ));
        }

        if let Some(seconds) = duration {
            if seconds < 0.0 {
                return Ok(ActionResult::failure(
                    format!("duration must be non-negative, got {seconds}"),
                    "validation",
                ));
            }
            exec.log("info", &format!("waiting {seconds}s"));
            if !sleep_cancellable(Duration::from_secs_f64(seconds), exec) {
                return Err(WorkflowError::Interrupted);
            }
            let mut outputs = Map::new();
            outputs.insert("waited".to_string(), json!(seconds));
            return Ok(ActionResult::success(outputs));
        }

        let condition = until.expect("checked above");
        let evaluator = evaluator_for(context, exec);
        let started = Instant::now();
        exec.log("info", &format!("waiting until condition holds (timeout {timeout}s)"));

        loop {
            // Evaluation errors keep polling; the condition may reference
            // state that appears later.
            if evaluator.evaluate_condition(condition).unwrap_or(false) {
                let waited = started.elapsed().as_secs_f64();
                let mut outputs = Map::new();
                outputs.insert("waited".to_string(), json!(waited));
                outputs.insert("condition_met".to_string(), json!(true));
                return Ok(ActionResult::success(outputs));
            }
            if started.elapsed().as_secs_f64() >= timeout {
                let mut result = ActionResult::failure(
                    format!("condition not met within {timeout}s"),
                    "timeout",
                );
                result.outputs.insert("waited".to_string(), json!(timeout));
                result
                    .outputs
                    .insert("condition_met".to_string(), json!(false));
                return Ok(result);
            }
            if !sleep_cancellable(Duration::from_secs_f64(interval), exec) {
                return Err(WorkflowError::Interrupted);
            }
        }
    }
}

/// Sleep in small slices so cancellation stays responsive. Returns false
/// when cancelled.
fn sleep_cancellable(duration: Duration, exec: &ExecutionContext) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if exec.cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
    !exec.cancel.is_cancelled()
}
