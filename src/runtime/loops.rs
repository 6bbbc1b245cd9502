//! The four loop controllers: init, check, advance, finalize.
//!
//! Loops are intentional cycles in the graph; they terminate through the
//! check node's bounded predicates, never through runtime cycle detection.
//! `break_if` is evaluated in advance, after the body, so `loop.output`
//! reflects the result of the item just processed.

use crate::actions::{ExecutionContext, StepOutcome};
use crate::error::{io_error, WorkflowError};
use crate::evaluator::Evaluator;
use crate::graph::LoopPlan;
use crate::runtime::state::WorkflowState;
use crate::schema::ResultStorage;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const LOOP_TRANSIENT_KEYS: &[&str] = &[
    "__loop_items",
    "__loop_empty",
    "__loop_failed",
    "__loop_reason",
    "__loop_break_requested",
    "__loop_break_reason",
    "__loop_break_item",
    "__loop_break_index",
    "__loop_results",
    "__loop_errors",
    "__loop_iteration_count",
    "__loop_success_count",
    "__loop_results_file",
];

/// Evaluate the loop source, materialize the items, and seed the frame.
pub fn run_init(
    plan: &LoopPlan,
    state: &mut WorkflowState,
    exec: &ExecutionContext,
) -> Result<(), WorkflowError> {
    let mut evaluator = Evaluator::new(state.evaluation_context());
    if let Some(workspace) = &exec.workspace {
        evaluator = evaluator.with_workspace(workspace.clone());
    }
    let resolved = match &plan.items_source {
        Value::String(expression) => evaluator.resolve(expression)?,
        literal => evaluator.resolve_all(literal)?,
    };
    let items = materialize_items(resolved);

    if items.is_empty() {
        state.insert("__loop_empty", json!(true));
        state.insert("__loop_reason", json!("empty"));
        reset_counters(state);
        state.insert("__next", json!(plan.check_node()));
        return Ok(());
    }

    let results_file = match (plan.result_storage, plan.aggregate_results) {
        (ResultStorage::File, true) => Some(init_results_file(plan)?),
        _ => None,
    };

    let parent = state.get("loop").cloned().unwrap_or(Value::Null);
    let frame = build_frame(&items, 0, parent, Value::Null);

    let mut stack = state.get_array("__loop_stack");
    stack.push(json!(plan.step_id));
    let depth = state.get_u64("__loop_depth") + 1;

    state.insert("loop", frame);
    state.insert("__loop_stack", Value::Array(stack));
    state.insert("__loop_depth", json!(depth));
    state.insert("__loop_items", Value::Array(items));
    state.insert("__loop_empty", json!(false));
    reset_counters(state);
    match results_file {
        Some(path) => state.insert("__loop_results_file", json!(path)),
        None => {
            state.remove("__loop_results_file");
        }
    }
    state.insert("__next", json!(plan.check_node()));
    Ok(())
}

/// Pure predicate: route to the body while iterations remain and no bound
/// has tripped, otherwise to finalize.
pub fn run_check(plan: &LoopPlan, state: &mut WorkflowState) -> Result<(), WorkflowError> {
    let finalize = plan.finalize_node();

    if state.flag("__loop_empty") {
        state.insert("__next", json!(finalize));
        return Ok(());
    }

    let Some(frame) = state.get("loop").cloned() else {
        state.insert("__loop_reason", json!("complete"));
        state.insert("__next", json!(finalize));
        return Ok(());
    };

    if state.flag("__loop_break_requested") {
        if state.get("__loop_reason").is_none() {
            state.insert("__loop_reason", json!("break_requested"));
        }
        state.insert("__next", json!(finalize));
        return Ok(());
    }

    if state.get_u64("__loop_iteration_count") >= plan.max_iterations {
        state.insert("__loop_reason", json!("max_iterations"));
        state.insert("__next", json!(finalize));
        return Ok(());
    }

    if state.get_array("__loop_errors").len() >= plan.max_errors {
        state.insert("__loop_reason", json!("max_errors"));
        state.insert("__next", json!(finalize));
        return Ok(());
    }

    let index0 = frame.get("index0").and_then(Value::as_u64).unwrap_or(0);
    let total = frame.get("total").and_then(Value::as_u64).unwrap_or(0);
    if index0 >= total {
        state.insert("__loop_reason", json!("complete"));
        state.insert("__next", json!(finalize));
        return Ok(());
    }

    state.insert("__next", json!(plan.body_node()));
    Ok(())
}

/// Record the body result, evaluate `break_if`, and step the frame.
pub fn run_advance(
    plan: &LoopPlan,
    state: &mut WorkflowState,
    exec: &ExecutionContext,
) -> Result<(), WorkflowError> {
    let Some(frame) = state.get("loop").cloned() else {
        state.insert("__next", json!(plan.finalize_node()));
        return Ok(());
    };

    let items = {
        let stored = state.get_array("__loop_items");
        if stored.is_empty() {
            frame
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        } else {
            stored
        }
    };

    let body = state
        .step_result(&plan.body_node())
        .cloned()
        .unwrap_or_else(|| json!({}));
    let body_outcome = body
        .get("outcome")
        .and_then(Value::as_str)
        .unwrap_or("success")
        .to_string();
    let body_outputs = body.get("outputs").cloned().unwrap_or_else(|| json!({}));
    let item = frame.get("item").cloned().unwrap_or(Value::Null);
    let index0 = frame.get("index0").and_then(Value::as_u64).unwrap_or(0);

    let iteration_count = state.get_u64("__loop_iteration_count") + 1;
    let mut success_count = state.get_u64("__loop_success_count");
    let mut results = state.get_array("__loop_results");
    let mut errors = state.get_array("__loop_errors");

    match body_outcome.as_str() {
        "success" => {
            success_count += 1;
            if plan.aggregate_results {
                let entry = json!({
                    "index": index0,
                    "item": item.clone(),
                    "outputs": body_outputs.clone(),
                });
                match plan.result_storage {
                    ResultStorage::Memory => {
                        results.push(entry);
                        // Sliding window keeps only the newest max_results.
                        if results.len() > plan.max_results {
                            let overflow = results.len() - plan.max_results;
                            results.drain(..overflow);
                        }
                    }
                    ResultStorage::File => {
                        if let Some(path) =
                            state.get("__loop_results_file").and_then(Value::as_str)
                        {
                            append_result_line(path, &entry)?;
                        }
                    }
                    ResultStorage::None => {}
                }
            }
        }
        "failure" => {
            errors.push(json!({
                "index": index0,
                "item": item.clone(),
                "error": body.get("error").cloned().unwrap_or(Value::Null),
                "error_type": body.get("error_type").cloned().unwrap_or(Value::Null),
            }));
            if !plan.continue_on_error {
                persist_counters(state, iteration_count, success_count, results, errors);
                state.insert("__loop_failed", json!(true));
                state.insert("__next", json!(plan.finalize_node()));
                return Ok(());
            }
        }
        // A skipped body (control/continue) is neither a result nor an
        // error; the iteration still counts toward max_iterations.
        _ => {}
    }

    if let Some(break_if) = &plan.break_if {
        if body_outcome == "success" {
            let mut ctx = state.evaluation_context();
            let mut frame_with_output = frame.clone();
            if let Value::Object(map) = &mut frame_with_output {
                map.insert("output".to_string(), body_outputs.clone());
            }
            ctx.insert("loop".to_string(), frame_with_output);
            let mut evaluator = Evaluator::new(ctx);
            if let Some(workspace) = &exec.workspace {
                evaluator = evaluator.with_workspace(workspace.clone());
            }
            if evaluator.evaluate_condition(break_if)? {
                persist_counters(state, iteration_count, success_count, results, errors);
                state.insert("__loop_break_requested", json!(true));
                state.insert("__loop_reason", json!("break_if"));
                state.insert("__loop_break_item", item);
                state.insert("__loop_break_index", json!(index0));
                state.insert("__next", json!(plan.finalize_node()));
                return Ok(());
            }
        }
    }

    let next_index0 = (index0 + 1) as usize;
    let parent = frame.get("parent").cloned().unwrap_or(Value::Null);
    let output = if body_outcome == "success" {
        body_outputs
    } else {
        Value::Null
    };
    let next_frame = build_frame(&items, next_index0, parent, output);

    persist_counters(state, iteration_count, success_count, results, errors);
    state.insert("loop", next_frame);
    state.insert("__next", json!(plan.check_node()));
    Ok(())
}

/// Unwind the loop: pop the stack, restore the parent frame, and write the
/// consolidated step result.
pub fn run_finalize(plan: &LoopPlan, state: &mut WorkflowState) -> Result<(), WorkflowError> {
    if state.flag("__loop_empty") {
        let outputs = consolidated_outputs(plan, &[], &[], 0, "empty", false, Value::Null, Value::Null, None);
        state.record_step_result(&plan.step_id, StepOutcome::Success, outputs, None, None);
        clear_transients(state);
        state.insert("__next", json!(plan.on_done.clone()));
        return Ok(());
    }

    let results = state.get_array("__loop_results");
    let errors = state.get_array("__loop_errors");
    let success_count = state.get_u64("__loop_success_count");
    let reason = state
        .get("__loop_reason")
        .and_then(Value::as_str)
        .unwrap_or("complete")
        .to_string();
    let break_requested = state.flag("__loop_break_requested");
    let break_item = state.get("__loop_break_item").cloned().unwrap_or(Value::Null);
    let break_index = state.get("__loop_break_index").cloned().unwrap_or(Value::Null);
    let results_file = state
        .get("__loop_results_file")
        .and_then(Value::as_str)
        .map(str::to_string);

    let parent = state
        .get("loop")
        .and_then(|frame| frame.get("parent"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut stack = state.get_array("__loop_stack");
    if stack.last().and_then(Value::as_str) == Some(plan.step_id.as_str()) {
        stack.pop();
    }
    let depth = state.get_u64("__loop_depth").saturating_sub(1);

    let outcome = if state.flag("__loop_failed") {
        StepOutcome::Failure
    } else if !errors.is_empty() {
        StepOutcome::Partial
    } else {
        StepOutcome::Success
    };
    let error = match outcome {
        StepOutcome::Failure => errors
            .last()
            .and_then(|entry| entry.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some("loop iteration failed".to_string())),
        _ => None,
    };

    let outputs = consolidated_outputs(
        plan,
        &results,
        &errors,
        success_count,
        &reason,
        break_requested,
        break_item,
        break_index,
        results_file,
    );
    state.record_step_result(
        &plan.step_id,
        outcome,
        outputs,
        error.as_deref(),
        if error.is_some() { Some("loop") } else { None },
    );

    if outcome == StepOutcome::Failure && !plan.has_failure_handler {
        state.insert("__workflow_failed", json!(true));
    }

    state.insert("loop", parent);
    state.insert("__loop_stack", Value::Array(stack));
    state.insert("__loop_depth", json!(depth));
    clear_transients(state);
    state.insert("__next", json!(plan.on_done.clone()));
    Ok(())
}

fn build_frame(items: &[Value], index0: usize, parent: Value, output: Value) -> Value {
    let total = items.len();
    json!({
        "items": items,
        "item": items.get(index0).cloned().unwrap_or(Value::Null),
        "index": index0 + 1,
        "index0": index0,
        "total": total,
        "first": index0 == 0,
        "last": total > 0 && index0 == total - 1,
        "revindex": total.saturating_sub(index0),
        "revindex0": total.saturating_sub(index0).saturating_sub(1),
        "output": output,
        "parent": parent,
    })
}

/// Materialize the loop source: sequences iterate, mappings iterate their
/// keys, scalars become a one-element sequence, null and empty become
/// empty.
fn materialize_items(resolved: Value) -> Vec<Value> {
    match resolved {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
        Value::String(s) if s.is_empty() => Vec::new(),
        scalar => vec![scalar],
    }
}

fn reset_counters(state: &mut WorkflowState) {
    state.insert("__loop_results", json!([]));
    state.insert("__loop_errors", json!([]));
    state.insert("__loop_iteration_count", json!(0));
    state.insert("__loop_success_count", json!(0));
}

fn persist_counters(
    state: &mut WorkflowState,
    iteration_count: u64,
    success_count: u64,
    results: Vec<Value>,
    errors: Vec<Value>,
) {
    state.insert("__loop_iteration_count", json!(iteration_count));
    state.insert("__loop_success_count", json!(success_count));
    state.insert("__loop_results", Value::Array(results));
    state.insert("__loop_errors", Value::Array(errors));
}

fn clear_transients(state: &mut WorkflowState) {
    for key in LOOP_TRANSIENT_KEYS {
        state.remove(key);
    }
}

#[allow(clippy::too_many_arguments)]
fn consolidated_outputs(
    plan: &LoopPlan,
    results: &[Value],
    errors: &[Value],
    success_count: u64,
    reason: &str,
    break_requested: bool,
    break_item: Value,
    break_index: Value,
    results_file: Option<String>,
) -> Map<String, Value> {
    let mut outputs = Map::new();
    match results_file {
        Some(path) if plan.result_storage == ResultStorage::File => {
            outputs.insert("results_file".to_string(), json!(path));
            outputs.insert("results".to_string(), json!([]));
        }
        _ => {
            outputs.insert("results".to_string(), Value::Array(results.to_vec()));
        }
    }
    outputs.insert("errors".to_string(), Value::Array(errors.to_vec()));
    outputs.insert(
        "count".to_string(),
        json!(success_count + errors.len() as u64),
    );
    outputs.insert("success_count".to_string(), json!(success_count));
    outputs.insert("reason".to_string(), json!(reason));
    outputs.insert(
        "result_storage".to_string(),
        json!(plan.result_storage.to_string()),
    );
    outputs.insert("break_early".to_string(), json!(break_requested));
    outputs.insert("break_item".to_string(), break_item);
    outputs.insert("break_index".to_string(), break_index);
    outputs
}

/// Create the JSONL results file inside a whitelisted directory (system
/// temp, home, or cwd), rejecting symlink escapes.
fn init_results_file(plan: &LoopPlan) -> Result<String, WorkflowError> {
    let dir = plan
        .result_file_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
    let canonical_dir = fs::canonicalize(&dir).map_err(|err| io_error(&dir, err))?;

    let mut allowed_roots = vec![std::env::temp_dir()];
    if let Some(home) = std::env::var_os("HOME") {
        allowed_roots.push(PathBuf::from(home));
    }
    if let Ok(cwd) = std::env::current_dir() {
        allowed_roots.push(cwd);
    }
    let allowed = allowed_roots
        .iter()
        .filter_map(|root| fs::canonicalize(root).ok())
        .any(|root| canonical_dir.starts_with(&root));
    if !allowed {
        return Err(WorkflowError::LoopStorage {
            path: dir.display().to_string(),
            reason: "result_file_dir must be within the system temp dir, home, or cwd".to_string(),
        });
    }

    let path = canonical_dir.join(format!(
        "loop_results_{}_{}.jsonl",
        plan.step_id,
        std::process::id()
    ));
    fs::write(&path, b"").map_err(|err| io_error(&path, err))?;
    let canonical_file = fs::canonicalize(&path).map_err(|err| io_error(&path, err))?;
    if !canonical_file.starts_with(&canonical_dir) {
        return Err(WorkflowError::LoopStorage {
            path: path.display().to_string(),
            reason: "result file resolves outside its directory".to_string(),
        });
    }
    Ok(path.display().to_string())
}

fn append_result_line(path: &str, entry: &Value) -> Result<(), WorkflowError> {
    let path = PathBuf::from(path);
    let line =
        serde_json::to_string(entry).map_err(|err| crate::error::json_error(&path, err))?;
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|err| io_error(&path, err))?;
    writeln!(file, "{line}").map_err(|err| io_error(&path, err))?;
    Ok(())
}
