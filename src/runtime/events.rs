//! The ordered event stream: the canonical boundary to observers.

use crate::shared::logging::append_jsonl_line;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Interrupted,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-describing execution events, emitted strictly in completion order:
/// `workflow_start → (step_start → chunks* → step_end)* → workflow_end`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    WorkflowStart {
        workflow: String,
        run_id: String,
        timestamp: String,
    },
    StepStart {
        run_id: String,
        step_id: String,
        timestamp: String,
    },
    /// Incremental output from a streaming action.
    TextChunk {
        run_id: String,
        step_id: String,
        text: String,
        timestamp: String,
    },
    StepEnd {
        run_id: String,
        step_id: String,
        outcome: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        timestamp: String,
    },
    WorkflowEnd {
        workflow: String,
        run_id: String,
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: String,
    },
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub trait EventSink: Send {
    fn emit(&mut self, event: &Event);
}

/// Appends each event as one JSON line; write failures never fail the run.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventSink for JsonlSink {
    fn emit(&mut self, event: &Event) {
        if let Ok(payload) = serde_json::to_value(event) {
            append_jsonl_line(&self.path, &payload);
        }
    }
}

/// In-memory sink for tests and progress displays.
#[derive(Debug, Clone, Default)]
pub struct CollectorSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl EventSink for CollectorSink {
    fn emit(&mut self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
