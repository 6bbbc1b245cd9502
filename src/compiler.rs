//! Lowering from a validated workflow definition to the executable graph.
//!
//! Compilation is pure: no I/O, no side effects. Transition declaration
//! order is evaluation order, and the cleanup-priority transition is always
//! inserted first so `__workflow_exit`/`__workflow_failed` preempt the
//! declared flow.

use crate::actions::ActionRegistry;
use crate::error::WorkflowError;
use crate::graph::{
    FinallyStep, Graph, Guard, LoopPlan, Node, NodeKind, Transition, CLEANUP_NODE, END_NODE,
};
use crate::schema::{
    ResultStorage, StepConfig, WorkflowDefinition, DEFAULT_MAX_ERRORS, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MAX_RESULTS,
};
use crate::shared::ids::{slug_from_name, validate_step_id};
use serde_json::json;
use std::collections::BTreeSet;

pub fn compile(workflow: &WorkflowDefinition, registry: &ActionRegistry) -> Result<Graph, WorkflowError> {
    Compiler::new(registry).compile(workflow)
}

struct Compiler<'a> {
    registry: &'a ActionRegistry,
    nodes: Vec<Node>,
    step_ids: Vec<String>,
    /// Where a transition targeting each step lands (cond/init/step node).
    entry_names: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(registry: &'a ActionRegistry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            step_ids: Vec::new(),
            entry_names: Vec::new(),
        }
    }

    fn compile(mut self, workflow: &WorkflowDefinition) -> Result<Graph, WorkflowError> {
        let steps = &workflow.jobs.main.steps;
        if steps.is_empty() {
            return Err(WorkflowError::compilation(
                "workflow has no steps in the `main` job",
                None,
            ));
        }

        // Pre-compute step ids so forward transitions resolve correctly.
        self.step_ids = steps
            .iter()
            .enumerate()
            .map(|(index, step)| generate_step_id(step, index))
            .collect::<Result<Vec<_>, _>>()?;

        self.entry_names = steps
            .iter()
            .zip(&self.step_ids)
            .map(|(step, step_id)| entry_node_name(step, step_id))
            .collect();

        let mut seen = BTreeSet::new();
        for step_id in &self.step_ids {
            if !seen.insert(step_id.clone()) {
                return Err(WorkflowError::compilation(
                    format!("duplicate step id `{step_id}`"),
                    None,
                ));
            }
        }

        for (index, step) in steps.iter().enumerate() {
            self.compile_step(step, index, steps.len())?;
        }

        self.push_cleanup_node(workflow)?;
        self.nodes.push(Node {
            name: END_NODE.to_string(),
            kind: NodeKind::End,
            transitions: Vec::new(),
        });

        self.insert_cleanup_priority_transitions();

        let entry = self.entry_names[0].clone();
        let mut graph = Graph::new(
            workflow.name.clone(),
            entry,
            workflow.env.clone(),
            workflow.inputs.clone(),
        );
        for node in self.nodes {
            graph.insert(node);
        }
        Ok(graph)
    }

    fn compile_step(&mut self, step: &StepConfig, index: usize, total: usize) -> Result<(), WorkflowError> {
        let step_id = self.step_ids[index].clone();

        if step.has_loop() {
            return self.compile_loop(step, &step_id, index, total);
        }
        if step.if_condition.is_some() {
            return self.compile_conditional(step, &step_id, index, total);
        }

        let action_type = self.resolve_action_type(step, &step_id)?;
        let next = self.next_step_name(index, total);

        let mut transitions = Vec::new();
        if let Some(handler) = &step.on_failure {
            transitions.push(Transition::when(
                self.failure_target(handler)?,
                "__step_outcome",
                json!("failure"),
            ));
        }
        transitions.push(Transition::default(next));

        self.nodes.push(Node {
            name: step_id.clone(),
            kind: NodeKind::Action {
                step: step.clone(),
                step_id,
                action_type,
                has_failure_handler: step.on_failure.is_some(),
            },
            transitions,
        });
        Ok(())
    }

    fn compile_conditional(
        &mut self,
        step: &StepConfig,
        step_id: &str,
        index: usize,
        total: usize,
    ) -> Result<(), WorkflowError> {
        let expression = step
            .if_condition
            .clone()
            .expect("caller checked if_condition");
        let next = self.next_step_name(index, total);
        let cond_node = format!("{step_id}_cond");

        self.nodes.push(Node {
            name: cond_node,
            kind: NodeKind::Condition {
                expression,
                body_id: step_id.to_string(),
            },
            transitions: vec![
                Transition::when(step_id, "__condition_met", json!(true)),
                Transition::default(next.clone()),
            ],
        });

        let mut body = step.clone();
        body.if_condition = None;
        let action_type = self.resolve_action_type(&body, step_id)?;

        let mut transitions = Vec::new();
        if let Some(handler) = &body.on_failure {
            transitions.push(Transition::when(
                self.failure_target(handler)?,
                "__step_outcome",
                json!("failure"),
            ));
        }
        transitions.push(Transition::default(next));

        self.nodes.push(Node {
            name: step_id.to_string(),
            kind: NodeKind::Action {
                step: body.clone(),
                step_id: step_id.to_string(),
                action_type,
                has_failure_handler: body.on_failure.is_some(),
            },
            transitions,
        });
        Ok(())
    }

    fn compile_loop(
        &mut self,
        step: &StepConfig,
        step_id: &str,
        index: usize,
        total: usize,
    ) -> Result<(), WorkflowError> {
        let next = self.next_step_name(index, total);
        let body_step = step.without_loop();
        let action_type = self.resolve_action_type(&body_step, step_id)?;

        let plan = LoopPlan {
            step_id: step_id.to_string(),
            items_source: step
                .loop_source
                .clone()
                .expect("caller checked has_loop"),
            break_if: step.break_if.clone(),
            max_iterations: step.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            max_results: step.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
            max_errors: step.max_errors.unwrap_or(DEFAULT_MAX_ERRORS),
            continue_on_error: step.continue_on_error.unwrap_or(false),
            aggregate_results: step.aggregate_results.unwrap_or(true),
            result_storage: step.result_storage.unwrap_or(ResultStorage::Memory),
            result_file_dir: step.result_file_dir.clone(),
            on_done: next.clone(),
            has_failure_handler: step.on_failure.is_some(),
        };

        let init = plan.init_node();
        let check = plan.check_node();
        let body = plan.body_node();
        let advance = plan.advance_node();
        let finalize = plan.finalize_node();

        self.nodes.push(Node {
            name: init.clone(),
            kind: NodeKind::LoopInit(plan.clone()),
            transitions: vec![
                Transition::when(next.clone(), "__next", json!(next.clone())),
                Transition::when(check.clone(), "__next", json!(check.clone())),
                Transition::default(check.clone()),
            ],
        });

        self.nodes.push(Node {
            name: check.clone(),
            kind: NodeKind::LoopCheck(plan.clone()),
            transitions: vec![
                Transition::when(finalize.clone(), "__next", json!(finalize.clone())),
                Transition::when(body.clone(), "__next", json!(body.clone())),
                Transition::default(body.clone()),
            ],
        });

        self.nodes.push(Node {
            name: body.clone(),
            kind: NodeKind::LoopBody {
                step: body_step,
                action_type,
                plan: plan.clone(),
            },
            transitions: vec![Transition::default(advance.clone())],
        });

        self.nodes.push(Node {
            name: advance.clone(),
            kind: NodeKind::LoopAdvance(plan.clone()),
            transitions: vec![
                Transition::when(finalize.clone(), "__next", json!(finalize.clone())),
                Transition::when(check.clone(), "__next", json!(check.clone())),
                Transition::default(check),
            ],
        });

        let mut finalize_transitions = Vec::new();
        if let Some(handler) = &step.on_failure {
            finalize_transitions.push(Transition::when(
                self.failure_target(handler)?,
                "__step_outcome",
                json!("failure"),
            ));
        }
        finalize_transitions.push(Transition::when(next.clone(), "__next", json!(next.clone())));
        finalize_transitions.push(Transition::default(next));

        self.nodes.push(Node {
            name: finalize,
            kind: NodeKind::LoopFinalize(plan),
            transitions: finalize_transitions,
        });
        Ok(())
    }

    fn push_cleanup_node(&mut self, workflow: &WorkflowDefinition) -> Result<(), WorkflowError> {
        let mut finally_steps = Vec::new();
        for (index, step) in workflow.all_finally_steps().iter().enumerate() {
            let step_id = match &step.id {
                Some(id) => id.as_str().to_string(),
                None => format!("finally_{index}"),
            };
            let action_type = self.resolve_action_type(step, &step_id)?;
            finally_steps.push(FinallyStep {
                step_id,
                step: step.clone(),
                action_type,
            });
        }
        self.nodes.push(Node {
            name: CLEANUP_NODE.to_string(),
            kind: NodeKind::Cleanup { finally_steps },
            transitions: vec![Transition::default(END_NODE)],
        });
        Ok(())
    }

    /// Every non-internal node gets a first-priority transition to cleanup.
    fn insert_cleanup_priority_transitions(&mut self) {
        for node in &mut self.nodes {
            if node.name.starts_with("__") {
                continue;
            }
            node.transitions
                .insert(0, Transition::new(CLEANUP_NODE, Guard::CleanupPriority));
        }
    }

    fn resolve_action_type(&self, step: &StepConfig, step_id: &str) -> Result<String, WorkflowError> {
        let action_type = if step.run.is_some() {
            "shell".to_string()
        } else if let Some(uses) = &step.uses {
            uses.clone()
        } else {
            return Err(WorkflowError::compilation(
                format!("step `{step_id}` has no `run` or `uses` field"),
                None,
            ));
        };
        if !self.registry.contains(&action_type) {
            return Err(WorkflowError::UnknownAction {
                suggestion: self.registry.suggest(&action_type),
                action_type,
            });
        }
        Ok(action_type)
    }

    fn next_step_name(&self, index: usize, total: usize) -> String {
        if index + 1 >= total {
            return CLEANUP_NODE.to_string();
        }
        self.entry_names[index + 1].clone()
    }

    /// Resolve an `on_failure` target to the node a transition lands on.
    fn failure_target(&self, handler: &str) -> Result<String, WorkflowError> {
        if handler == CLEANUP_NODE {
            return Ok(CLEANUP_NODE.to_string());
        }
        self.step_ids
            .iter()
            .position(|id| id == handler)
            .map(|index| self.entry_names[index].clone())
            .ok_or_else(|| {
                WorkflowError::compilation(
                    format!("`on_failure` references unknown step `{handler}`"),
                    None,
                )
            })
    }
}

/// Where a transition targeting a step actually lands: its condition probe
/// for `if:` steps, its init node for loops, the step node otherwise.
fn entry_node_name(step: &StepConfig, step_id: &str) -> String {
    if step.has_loop() {
        format!("{step_id}_init")
    } else if step.if_condition.is_some() {
        format!("{step_id}_cond")
    } else {
        step_id.to_string()
    }
}

pub fn generate_step_id(step: &StepConfig, index: usize) -> Result<String, WorkflowError> {
    let step_id = if let Some(id) = &step.id {
        id.as_str().to_string()
    } else if let Some(name) = &step.name {
        slug_from_name(name, index)
    } else {
        format!("step_{index}")
    };
    validate_step_id(&step_id)
        .map_err(|reason| WorkflowError::compilation(format!("invalid step id: {reason}"), None))?;
    Ok(step_id)
}
