//! The compiled workflow graph: nodes keyed by name with ordered, guarded
//! transitions. Internal controllers (condition probes, loop nodes, cleanup)
//! are enum variants interpreted by the runtime; only user steps dispatch
//! through the action registry.

use crate::schema::{InputDefinition, ResultStorage, StepConfig};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CLEANUP_NODE: &str = "__cleanup__";
pub const END_NODE: &str = "__end__";

#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub entry: String,
    pub env: Map<String, Value>,
    pub input_definitions: BTreeMap<String, InputDefinition>,
    nodes: BTreeMap<String, Node>,
    /// Node names in compilation order, for deterministic iteration.
    order: Vec<String>,
}

impl Graph {
    pub fn new(
        name: String,
        entry: String,
        env: Map<String, Value>,
        input_definitions: BTreeMap<String, InputDefinition>,
    ) -> Self {
        Self {
            name,
            entry,
            env,
            input_definitions,
            nodes: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn insert(&mut self, node: Node) {
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// User-visible step count (excludes internal controllers).
    pub fn step_count(&self) -> usize {
        self.order
            .iter()
            .filter(|name| {
                self.nodes
                    .get(*name)
                    .map(|node| matches!(node.kind, NodeKind::Action { .. } | NodeKind::LoopBody { .. }))
                    .unwrap_or(false)
            })
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A user step backed by a registry action.
    Action {
        step: StepConfig,
        step_id: String,
        action_type: String,
        has_failure_handler: bool,
    },
    /// Evaluates an `if:` expression and records a skipped result for the
    /// body when false.
    Condition { expression: String, body_id: String },
    LoopInit(LoopPlan),
    LoopCheck(LoopPlan),
    /// The user-supplied action inside a loop cycle.
    LoopBody {
        step: StepConfig,
        action_type: String,
        plan: LoopPlan,
    },
    LoopAdvance(LoopPlan),
    LoopFinalize(LoopPlan),
    /// Runs finally steps with error isolation.
    Cleanup { finally_steps: Vec<FinallyStep> },
    End,
}

#[derive(Debug, Clone)]
pub struct FinallyStep {
    pub step_id: String,
    pub step: StepConfig,
    pub action_type: String,
}

/// Everything the four loop controllers need, cloned into each of them.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    pub step_id: String,
    pub items_source: Value,
    pub break_if: Option<String>,
    pub max_iterations: u64,
    pub max_results: usize,
    pub max_errors: usize,
    pub continue_on_error: bool,
    pub aggregate_results: bool,
    pub result_storage: ResultStorage,
    pub result_file_dir: Option<String>,
    pub on_done: String,
    pub has_failure_handler: bool,
}

impl LoopPlan {
    pub fn init_node(&self) -> String {
        format!("{}_init", self.step_id)
    }

    pub fn check_node(&self) -> String {
        format!("{}_check", self.step_id)
    }

    pub fn body_node(&self) -> String {
        format!("{}_body", self.step_id)
    }

    pub fn advance_node(&self) -> String {
        format!("{}_advance", self.step_id)
    }

    pub fn finalize_node(&self) -> String {
        format!("{}_finalize", self.step_id)
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub target: String,
    pub guard: Guard,
}

impl Transition {
    pub fn new(target: impl Into<String>, guard: Guard) -> Self {
        Self {
            target: target.into(),
            guard,
        }
    }

    pub fn default(target: impl Into<String>) -> Self {
        Self::new(target, Guard::Default)
    }

    pub fn when(target: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self::new(
            target,
            Guard::StateEquals {
                key: key.into(),
                value,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Always matches.
    Default,
    /// Matches when a state key equals a value.
    StateEquals { key: String, value: Value },
    /// Matches when `__workflow_exit` or `__workflow_failed` is set.
    CleanupPriority,
}
