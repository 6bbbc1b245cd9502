//! Typed workflow definition deserialized from the YAML document.
//!
//! Dynamic leaves (`with:`, `env:`, input defaults) stay as
//! `serde_json::Value`; everything structural is typed and parse-validated
//! on deserialize.

use crate::error::WorkflowError;
use crate::shared::ids::StepId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0"];

pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000;
pub const DEFAULT_MAX_RESULTS: usize = 100;
pub const DEFAULT_MAX_ERRORS: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    #[serde(default)]
    pub env: Map<String, Value>,
    pub jobs: Jobs,
    #[serde(default, rename = "finally")]
    pub finally_steps: Vec<StepConfig>,
    /// Action-specific defaults (e.g. an `llm:` block); opaque to the core.
    #[serde(default)]
    pub llm: Option<Value>,
}

impl WorkflowDefinition {
    pub fn from_value(document: &Value) -> Result<Self, WorkflowError> {
        serde_json::from_value(document.clone()).map_err(|err| {
            WorkflowError::validation(format!("workflow definition is invalid: {err}"), None)
        })
    }

    /// Finally steps from both `jobs.main.finally` and the top level, in
    /// declared order.
    pub fn all_finally_steps(&self) -> Vec<StepConfig> {
        let mut steps = self.jobs.main.finally_steps.clone();
        steps.extend(self.finally_steps.iter().cloned());
        steps
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jobs {
    pub main: JobConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub steps: Vec<StepConfig>,
    #[serde(default, rename = "finally")]
    pub finally_steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub id: Option<StepId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default, rename = "with")]
    pub with_params: Map<String, Value>,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    /// Loop source: an expression string, or a literal value materialized
    /// directly (`loop: true` makes an unbounded loop).
    #[serde(default, rename = "loop")]
    pub loop_source: Option<Value>,
    #[serde(default)]
    pub break_if: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub max_errors: Option<usize>,
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    #[serde(default)]
    pub aggregate_results: Option<bool>,
    #[serde(default)]
    pub result_storage: Option<ResultStorage>,
    #[serde(default)]
    pub result_file_dir: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Step timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Post-action validator configuration; shape only, interpreted by
    /// action-side guardrail routers.
    #[serde(default)]
    pub guardrails: Option<Value>,
    #[serde(default)]
    pub capture_mode: Option<CaptureMode>,
}

impl StepConfig {
    /// The step body without its loop marker, used as the loop body config.
    pub fn without_loop(&self) -> StepConfig {
        let mut body = self.clone();
        body.loop_source = None;
        body.break_if = None;
        body
    }

    pub fn has_loop(&self) -> bool {
        self.loop_source.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStorage {
    Memory,
    File,
    None,
}

impl Default for ResultStorage {
    fn default() -> Self {
        ResultStorage::Memory
    }
}

impl std::fmt::Display for ResultStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStorage::Memory => write!(f, "memory"),
            ResultStorage::File => write!(f, "file"),
            ResultStorage::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in seconds before the first retry.
    #[serde(default = "default_delay")]
    pub delay: f64,
    /// Backoff multiplier applied per attempt.
    #[serde(default = "default_backoff", rename = "backoff")]
    pub multiplier: f64,
    /// Ceiling on the computed delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// Restrict retries to these error kinds; empty means retry on any.
    #[serde(default)]
    pub retry_on: Vec<String>,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            multiplier: default_backoff(),
            max_delay: default_max_delay(),
            retry_on: Vec::new(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> f64 {
    1.0
}

fn default_backoff() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDefinition {
    #[serde(default, rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, rename = "enum")]
    pub allowed_values: Option<Vec<Value>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl Default for InputType {
    fn default() -> Self {
        InputType::String
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputType::String => write!(f, "string"),
            InputType::Number => write!(f, "number"),
            InputType::Integer => write!(f, "integer"),
            InputType::Boolean => write!(f, "boolean"),
            InputType::Array => write!(f, "array"),
            InputType::Object => write!(f, "object"),
        }
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(OneOrMany::One(value)) => Ok(vec![value]),
        Some(OneOrMany::Many(values)) => Ok(values),
    }
}
