//! The action interface: the engine's sole extension point.
//!
//! An action reads a view of workflow state, performs its effect, and
//! returns an [`ActionResult`]. The runtime is otherwise action-agnostic;
//! hosts register actions through the [`ActionRegistry`] and provide
//! capabilities through the [`ExecutionContext`].

pub mod control;
pub mod registry;
pub mod shell;

pub use registry::ActionRegistry;

use crate::error::WorkflowError;
use crate::schema::StepConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
    Suspended,
    Partial,
    Break,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Suspended => "suspended",
            StepOutcome::Partial => "partial",
            StepOutcome::Break => "break",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub outputs: Map<String, Value>,
    pub outcome: StepOutcome,
    pub error: Option<String>,
    pub error_type: Option<String>,
    /// Optional routing hint mirrored into `__next` by the runtime.
    pub next_hint: Option<String>,
}

impl ActionResult {
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            outcome: StepOutcome::Success,
            error: None,
            error_type: None,
            next_hint: None,
        }
    }

    pub fn failure(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            outputs: Map::new(),
            outcome: StepOutcome::Failure,
            error: Some(error.into()),
            error_type: Some(error_type.into()),
            next_hint: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            outputs: Map::new(),
            outcome: StepOutcome::Skipped,
            error: None,
            error_type: None,
            next_hint: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == StepOutcome::Failure
    }
}

pub trait Action: Send + Sync {
    fn action_type(&self) -> &str;

    /// Top-level state keys this action consumes.
    fn reads(&self) -> &[&str] {
        &[]
    }

    /// Top-level state keys this action produces.
    fn writes(&self) -> &[&str] {
        &[]
    }

    /// Execute against a read-only view of state (`inputs`, `env`, `steps`,
    /// `loop`, and `__resume_data` when resuming). May block; should poll
    /// `exec.cancel` during long operations.
    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError>;
}

/// Cooperative cancellation flag shared between the host, the runtime, and
/// running actions.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A shell execution request issued by an action to the host capability.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait ShellCapability: Send + Sync {
    fn run(&self, request: &ShellRequest, cancel: &CancellationToken)
        -> Result<ShellOutput, WorkflowError>;
}

/// Runs a command attached to the user's terminal (TTY); no capture.
pub trait InteractiveCapability: Send + Sync {
    fn run_interactive(
        &self,
        request: &ShellRequest,
        cancel: &CancellationToken,
    ) -> Result<i32, WorkflowError>;
}

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub prompt: String,
    pub options: Option<Vec<String>>,
    pub default: Option<String>,
}

pub trait PromptCapability: Send + Sync {
    fn prompt(&self, request: &PromptRequest) -> Result<String, WorkflowError>;
}

pub trait LogCapability: Send + Sync {
    fn log(&self, level: &str, message: &str);
}

/// Host-provided capabilities. All optional; actions degrade gracefully
/// when one is absent.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub workspace: Option<PathBuf>,
    pub shell: Option<Arc<dyn ShellCapability>>,
    pub interactive: Option<Arc<dyn InteractiveCapability>>,
    pub prompt: Option<Arc<dyn PromptCapability>>,
    pub log: Option<Arc<dyn LogCapability>>,
    pub cancel: CancellationToken,
    /// Effective timeout for the current step, set by the runtime.
    pub step_timeout: Option<Duration>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellCapability>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PromptCapability>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn LogCapability>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn log(&self, level: &str, message: &str) {
        if let Some(sink) = &self.log {
            sink.log(level, message);
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workspace", &self.workspace)
            .field("shell", &self.shell.is_some())
            .field("interactive", &self.interactive.is_some())
            .field("prompt", &self.prompt.is_some())
            .field("log", &self.log.is_some())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}
