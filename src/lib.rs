pub mod actions;
pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod parser;
pub mod runtime;
pub mod schema;
pub mod shared;
pub mod validator;

pub use crate::actions::{Action, ActionRegistry, ActionResult, ExecutionContext, StepOutcome};
pub use crate::compiler::compile;
pub use crate::error::{SourceLocation, WorkflowError};
pub use crate::evaluator::Evaluator;
pub use crate::graph::Graph;
pub use crate::parser::WorkflowParser;
pub use crate::runtime::{
    CollectorSink, Event, EventSink, ExecutionStatus, JsonlSink, RunOptions, WorkflowRunner,
};
pub use crate::schema::WorkflowDefinition;
pub use crate::validator::{validate_workflow, ValidationResult};
