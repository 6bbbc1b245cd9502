use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<PathBuf>,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(file: Option<PathBuf>, line: usize, column: usize) -> Self {
        Self { file, line, column }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.display(), self.line, self.column),
            None => write!(f, "line {}, column {}", self.line, self.column),
        }
    }
}

fn located(location: &Option<SourceLocation>) -> String {
    match location {
        Some(location) => format!("{location}: "),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{}{message}", located(.location))]
    Validation {
        message: String,
        location: Option<SourceLocation>,
    },
    #[error("{}{message}", located(.location))]
    Compilation {
        message: String,
        location: Option<SourceLocation>,
    },
    #[error("unknown action type `{action_type}`{}", .suggestion.as_ref().map(|s| format!("; did you mean `{s}`?")).unwrap_or_default())]
    UnknownAction {
        action_type: String,
        suggestion: Option<String>,
    },
    #[error("expression error in `${{{{ {expression} }}}}`: {message}")]
    Expression { expression: String, message: String },
    #[error("blocked dangerous pattern `{pattern}` in expression `{expression}`")]
    BlockedExpression { pattern: String, expression: String },
    #[error("security violation: {0}")]
    Security(String),
    #[error("path `{path}` escapes allowed base `{allowed_base}`")]
    PathTraversal { path: String, allowed_base: String },
    #[error("step `{step_id}` failed ({kind}): {message}")]
    ActionFailed {
        step_id: String,
        kind: String,
        message: String,
    },
    #[error("input `{name}` is invalid: {reason}")]
    InvalidInput { name: String, reason: String },
    #[error("loop result storage rejected `{path}`: {reason}")]
    LoopStorage { path: String, reason: String },
    #[error("step `{step_id}` timed out after {seconds}s")]
    StepTimeout { step_id: String, seconds: u64 },
    #[error("workflow timed out after {seconds}s")]
    WorkflowTimeout { seconds: u64 },
    #[error("workflow interrupted")]
    Interrupted,
    #[error("workflow suspended at step `{step_id}`; resume with input")]
    Suspended { step_id: String },
    #[error("no suspended step to resume")]
    NotSuspended,
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}invalid yaml: {source}", located(.location))]
    Yaml {
        location: Option<SourceLocation>,
        #[source]
        source: serde_yaml::Error,
    },
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>, location: Option<SourceLocation>) -> Self {
        Self::Validation {
            message: message.into(),
            location,
        }
    }

    pub fn compilation(message: impl Into<String>, location: Option<SourceLocation>) -> Self {
        Self::Compilation {
            message: message.into(),
            location,
        }
    }

    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Stable error-kind tag used for `retry_on` matching and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Compilation { .. } | Self::UnknownAction { .. } => "compilation",
            Self::Expression { .. } => "expression",
            Self::BlockedExpression { .. }
            | Self::Security(_)
            | Self::PathTraversal { .. }
            | Self::LoopStorage { .. } => "security",
            Self::ActionFailed { .. } => "action",
            Self::InvalidInput { .. } => "validation",
            Self::StepTimeout { .. } | Self::WorkflowTimeout { .. } => "timeout",
            Self::Interrupted => "interrupted",
            Self::Suspended { .. } | Self::NotSuspended => "suspended",
            Self::Io { .. } => "io",
            Self::Json { .. } | Self::Yaml { .. } => "parse",
        }
    }
}

pub fn io_error(path: &std::path::Path, source: std::io::Error) -> WorkflowError {
    WorkflowError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn json_error(path: &std::path::Path, source: serde_json::Error) -> WorkflowError {
    WorkflowError::Json {
        path: path.display().to_string(),
        source,
    }
}
