//! Workflow state: a single-writer JSON map with reserved-key protection.
//!
//! Each node execution updates the state through the runtime; readers only
//! ever see snapshots. Keys starting with `__` are control keys owned by
//! the engine and are stripped from user action outputs.

use crate::actions::StepOutcome;
use crate::evaluator::is_truthy;
use serde_json::{json, Map, Value};

/// Control keys user actions can never write into `steps[*].outputs`.
pub const RESERVED_STATE_KEYS: &[&str] = &[
    "__next",
    "__condition_met",
    "__step_outcome",
    "__step_error",
    "__workflow_exit",
    "__workflow_failed",
    "__loop_stack",
    "__loop_depth",
    "__loop_items",
    "__loop_empty",
    "__loop_results",
    "__loop_errors",
    "__loop_iteration_count",
    "__loop_success_count",
    "__loop_failed",
    "__loop_reason",
    "__loop_break_requested",
    "__loop_break_reason",
    "__loop_break_item",
    "__loop_break_index",
    "__loop_results_file",
    "__cleanup_complete",
    "__cleanup_warnings",
    "__cleanup_errors",
    "__suspend_prompt",
    "__suspend_type",
    "__suspend_options",
    "__suspend_default",
    "__suspend_timeout",
    "__resume_data",
];

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("__") || RESERVED_STATE_KEYS.contains(&key)
}

/// Strip reserved keys from user action outputs so a step cannot hijack
/// control flow by echoing `__next` or loop flags.
pub fn sanitize_outputs(outputs: &Map<String, Value>) -> Map<String, Value> {
    outputs
        .iter()
        .filter(|(key, _)| !is_reserved_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// The control keys an action's raw outputs may legitimately set; this is
/// how control actions talk to the runtime.
pub const CONTROL_KEY_WHITELIST: &[&str] = &[
    "__workflow_exit",
    "__exit_status",
    "__exit_message",
    "__exit_outputs",
    "__workflow_failed",
    "__error_message",
    "__error_code",
    "__error_details",
    "__loop_break_requested",
    "__loop_break_reason",
    "__loop_break_item",
    "__loop_break_index",
];

#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    values: Map<String, Value>,
}

impl WorkflowState {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Truthiness of a control flag; missing keys are false.
    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).map(is_truthy).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.values.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn get_array(&self, key: &str) -> Vec<Value> {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }

    /// The read-only view handed to actions and the evaluator: `inputs`,
    /// `env`, `steps`, `loop`, plus `__resume_data` while resuming.
    pub fn evaluation_context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        for key in ["inputs", "env", "steps", "loop"] {
            ctx.insert(
                key.to_string(),
                self.values.get(key).cloned().unwrap_or_else(|| match key {
                    "loop" => Value::Null,
                    _ => json!({}),
                }),
            );
        }
        if let Some(resume) = self.values.get("__resume_data") {
            ctx.insert("__resume_data".to_string(), resume.clone());
        }
        ctx
    }

    /// Record a step result and mirror the outcome into the routing keys.
    pub fn record_step_result(
        &mut self,
        step_id: &str,
        outcome: StepOutcome,
        outputs: Map<String, Value>,
        error: Option<&str>,
        error_type: Option<&str>,
    ) {
        let mut entry = Map::new();
        entry.insert("outcome".to_string(), json!(outcome.as_str()));
        entry.insert("outputs".to_string(), Value::Object(outputs));
        if let Some(error) = error {
            entry.insert("error".to_string(), json!(error));
        }
        if let Some(error_type) = error_type {
            entry.insert("error_type".to_string(), json!(error_type));
        }

        let steps = self
            .values
            .entry("steps".to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(steps) = steps {
            steps.insert(step_id.to_string(), Value::Object(entry));
        }

        self.values
            .insert("__step_outcome".to_string(), json!(outcome.as_str()));
        self.values
            .insert("__step_error".to_string(), json!(error.is_some()));
    }

    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.values.get("steps").and_then(|steps| steps.get(step_id))
    }
}
