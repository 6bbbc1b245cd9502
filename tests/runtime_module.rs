use flowstone::actions::{
    Action, ActionRegistry, ActionResult, ExecutionContext, StepOutcome,
};
use flowstone::compiler::compile;
use flowstone::error::WorkflowError;
use flowstone::parser::WorkflowParser;
use flowstone::runtime::{
    CollectorSink, Event, ExecutionResult, ExecutionStatus, RunOptions, WorkflowRunner,
};
use flowstone::schema::{StepConfig, WorkflowDefinition};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn definition(yaml: &str) -> WorkflowDefinition {
    let parsed = WorkflowParser::new().parse_str(yaml).expect("yaml parses");
    WorkflowDefinition::from_value(&parsed.document).expect("definition")
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("inputs must be an object"),
    }
}

fn run_yaml(yaml: &str, inputs: Value) -> (ExecutionResult, Vec<Event>) {
    run_with_registry(yaml, inputs, ActionRegistry::with_builtins(), RunOptions::default())
}

fn run_with_registry(
    yaml: &str,
    inputs: Value,
    registry: ActionRegistry,
    options: RunOptions,
) -> (ExecutionResult, Vec<Event>) {
    let workflow = definition(yaml);
    let graph = compile(&workflow, &registry).expect("compiles");
    let mut runner = WorkflowRunner::new(registry, ExecutionContext::new()).with_options(options);
    let collector = CollectorSink::new();
    runner.add_sink(Box::new(collector.clone()));
    let result = runner.run(&graph, as_map(inputs)).expect("runs");
    (result, collector.collected())
}

fn step_outcome(result: &ExecutionResult, step_id: &str) -> String {
    result.final_state["steps"][step_id]["outcome"]
        .as_str()
        .expect("outcome")
        .to_string()
}

#[test]
fn linear_success_emits_ordered_events() {
    let (result, events) = run_yaml(
        r#"
schema_version: "1.0"
name: linear
jobs:
  main:
    steps:
      - id: a
        run: echo ok
      - id: b
        run: echo done
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.step_sequence, vec!["a", "b"]);
    assert_eq!(result.final_state["steps"]["a"]["outputs"]["stdout"], json!("ok\n"));
    assert_eq!(step_outcome(&result, "a"), "success");
    assert_eq!(step_outcome(&result, "b"), "success");

    let shape: Vec<String> = events
        .iter()
        .map(|event| match event {
            Event::WorkflowStart { .. } => "workflow_start".to_string(),
            Event::StepStart { step_id, .. } => format!("start:{step_id}"),
            Event::StepEnd {
                step_id, outcome, ..
            } => format!("end:{step_id}:{outcome}"),
            Event::TextChunk { .. } => "chunk".to_string(),
            Event::WorkflowEnd { status, .. } => format!("workflow_end:{status}"),
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            "workflow_start",
            "start:a",
            "end:a:success",
            "start:b",
            "end:b:success",
            "workflow_end:completed",
        ]
    );
}

#[test]
fn conditional_false_records_skipped_body() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: conditional
jobs:
  main:
    steps:
      - id: a
        run: "true"
      - id: b
        if: "${{ false }}"
        run: echo no
      - id: c
        run: echo yes
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(step_outcome(&result, "b"), "skipped");
    assert_eq!(result.final_state["steps"]["b"]["outputs"], json!({}));
    assert_eq!(result.final_state["steps"]["c"]["outputs"]["stdout"], json!("yes\n"));
}

#[test]
fn on_failure_routes_to_handler_and_continues() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: failure-routing
jobs:
  main:
    steps:
      - id: a
        run: exit 1
        on_failure: h
      - id: h
        run: echo handled
      - id: b
        run: echo b
"#,
        json!({}),
    );

    assert_eq!(result.step_sequence, vec!["a", "h", "b"]);
    assert_eq!(step_outcome(&result, "a"), "failure");
    assert_eq!(step_outcome(&result, "h"), "success");
    // A handled failure does not fail the workflow.
    assert_eq!(result.status, ExecutionStatus::Completed);
}

#[test]
fn unhandled_failure_runs_finally_and_fails() {
    let (result, events) = run_yaml(
        r#"
schema_version: "1.0"
name: cleanup-priority
jobs:
  main:
    steps:
      - id: a
        run: exit 3
      - id: never
        run: echo unreachable
finally:
  - id: bye
    run: echo bye
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(step_outcome(&result, "a"), "failure");
    assert!(result.final_state["steps"].get("never").is_none());
    // The finally step ran and its outcome is recorded separately.
    assert_eq!(step_outcome(&result, "bye"), "success");
    assert!(matches!(
        events.last(),
        Some(Event::WorkflowEnd {
            status: ExecutionStatus::Failed,
            ..
        })
    ));
}

#[test]
fn shell_quote_keeps_hostile_input_a_single_token() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: quoting
inputs:
  target:
    type: string
jobs:
  main:
    steps:
      - id: echo
        run: echo ${{ inputs.target | shell_quote }}
"#,
        json!({"target": "; rm -rf /"}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        result.final_state["steps"]["echo"]["outputs"]["stdout"],
        json!("; rm -rf /\n")
    );
}

struct RecordingAction;

impl Action for RecordingAction {
    fn action_type(&self) -> &str {
        "test/record"
    }

    fn execute(
        &self,
        _step: &StepConfig,
        _context: &Map<String, Value>,
        _exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let mut outputs = Map::new();
        outputs.insert("__next".to_string(), json!("evil"));
        outputs.insert("__loop_break_requested".to_string(), json!(true));
        outputs.insert("result".to_string(), json!(42));
        Ok(ActionResult::success(outputs))
    }
}

#[test]
fn reserved_keys_are_stripped_from_outputs() {
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(RecordingAction));
    let (result, _) = run_with_registry(
        r#"
schema_version: "1.0"
name: stripping
jobs:
  main:
    steps:
      - id: record
        uses: test/record
      - id: after
        run: echo after
"#,
        json!({}),
        registry,
        RunOptions::default(),
    );

    assert_eq!(
        result.final_state["steps"]["record"]["outputs"],
        json!({"result": 42})
    );
    // The hint was not honored: execution continued to the declared next
    // step rather than `evil`.
    assert_eq!(result.step_sequence, vec!["record", "after"]);
    assert_eq!(result.status, ExecutionStatus::Completed);
}

struct GateAction;

impl Action for GateAction {
    fn action_type(&self) -> &str {
        "test/gate"
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        _exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let step_id = step.id.as_ref().map(|id| id.as_str()).unwrap_or("gate");
        if let Some(payload) = context
            .get("__resume_data")
            .and_then(|data| data.get(step_id))
        {
            let mut outputs = Map::new();
            outputs.insert("answer".to_string(), payload.clone());
            return Ok(ActionResult::success(outputs));
        }
        let mut outputs = Map::new();
        outputs.insert("prompt".to_string(), json!("Continue?"));
        outputs.insert("type".to_string(), json!("confirm"));
        Ok(ActionResult {
            outputs,
            outcome: StepOutcome::Suspended,
            error: None,
            error_type: None,
            next_hint: None,
        })
    }
}

#[test]
fn suspension_surfaces_request_and_resume_completes() {
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(GateAction));
    let workflow = definition(
        r#"
schema_version: "1.0"
name: gated
jobs:
  main:
    steps:
      - id: ask
        uses: test/gate
      - id: after
        run: echo resumed
"#,
    );
    let graph = compile(&workflow, &registry).expect("compiles");
    let mut runner = WorkflowRunner::new(registry, ExecutionContext::new());

    let first = runner.run(&graph, Map::new()).expect("runs");
    assert_eq!(first.status, ExecutionStatus::Suspended);
    let suspension = first.suspension.clone().expect("suspension request");
    assert_eq!(suspension.step_id, "ask");
    assert_eq!(suspension.prompt, "Continue?");
    assert_eq!(suspension.suspension_type, "confirm");

    let resumed = runner.resume(&graph, first, json!("yes")).expect("resumes");
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.final_state["steps"]["ask"]["outputs"]["answer"], json!("yes"));
    assert_eq!(
        resumed.final_state["steps"]["after"]["outputs"]["stdout"],
        json!("resumed\n")
    );
}

#[test]
fn control_exit_skips_remaining_steps_but_runs_finally() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: early-exit
jobs:
  main:
    steps:
      - id: leave
        uses: control/exit
        with:
          status: success
          message: done early
          outputs:
            total: "${{ 1 + 1 }}"
      - id: never
        run: echo unreachable
finally:
  - id: bye
    run: echo bye
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.final_state["steps"].get("never").is_none());
    assert_eq!(step_outcome(&result, "bye"), "success");
    assert_eq!(result.outputs["workflow"], json!({"total": 2}));
}

struct FlakyAction {
    calls: Arc<AtomicU32>,
    failures_before_success: u32,
}

impl Action for FlakyAction {
    fn action_type(&self) -> &str {
        "test/flaky"
    }

    fn execute(
        &self,
        _step: &StepConfig,
        _context: &Map<String, Value>,
        _exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            return Ok(ActionResult::failure("transient failure", "network"));
        }
        let mut outputs = Map::new();
        outputs.insert("attempt".to_string(), json!(call));
        Ok(ActionResult::success(outputs))
    }
}

#[test]
fn retries_back_off_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(FlakyAction {
        calls: calls.clone(),
        failures_before_success: 2,
    }));
    let (result, _) = run_with_registry(
        r#"
schema_version: "1.0"
name: retrying
jobs:
  main:
    steps:
      - id: flaky
        uses: test/flaky
        retry:
          max_attempts: 3
          delay: 0.01
          jitter: false
          retry_on: [network]
"#,
        json!({}),
        registry,
        RunOptions::default(),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.final_state["steps"]["flaky"]["outputs"]["attempt"], json!(3));
}

#[test]
fn retry_on_excludes_other_error_kinds() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(FlakyAction {
        calls: calls.clone(),
        failures_before_success: 2,
    }));
    let (result, _) = run_with_registry(
        r#"
schema_version: "1.0"
name: no-retry
jobs:
  main:
    steps:
      - id: flaky
        uses: test/flaky
        retry:
          max_attempts: 3
          delay: 0.01
          jitter: false
          retry_on: [timeout]
"#,
        json!({}),
        registry,
        RunOptions::default(),
    );

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn step_timeout_records_timeout_failure() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: step-timeout
jobs:
  main:
    steps:
      - id: slow
        run: sleep 5
        timeout: 0.2
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(step_outcome(&result, "slow"), "failure");
    assert_eq!(
        result.final_state["steps"]["slow"]["error_type"],
        json!("timeout")
    );
}

#[test]
fn workflow_timeout_cancels_current_step() {
    let (result, _) = run_with_registry(
        r#"
schema_version: "1.0"
name: workflow-timeout
jobs:
  main:
    steps:
      - id: slow
        run: sleep 5
finally:
  - id: bye
    run: echo bye
"#,
        json!({}),
        ActionRegistry::with_builtins(),
        RunOptions {
            workflow_timeout: Some(Duration::from_millis(300)),
            ..RunOptions::default()
        },
    );

    assert_eq!(result.status, ExecutionStatus::Timeout);
    // Finally runs on the timeout path too.
    assert_eq!(step_outcome(&result, "bye"), "success");
}

#[test]
fn cancellation_interrupts_and_still_runs_finally() {
    let registry = ActionRegistry::with_builtins();
    let workflow = definition(
        r#"
schema_version: "1.0"
name: cancelled
jobs:
  main:
    steps:
      - id: slow
        run: sleep 5
finally:
  - id: bye
    run: echo bye
"#,
    );
    let graph = compile(&workflow, &registry).expect("compiles");
    let mut runner = WorkflowRunner::new(registry, ExecutionContext::new());
    let token = runner.cancellation_token();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        token.cancel();
    });
    let result = runner.run(&graph, Map::new()).expect("runs");
    canceller.join().expect("canceller joins");

    assert_eq!(result.status, ExecutionStatus::Interrupted);
    assert_eq!(step_outcome(&result, "bye"), "success");
}

#[test]
fn missing_required_input_is_fatal_before_any_step() {
    let registry = ActionRegistry::with_builtins();
    let workflow = definition(
        r#"
schema_version: "1.0"
name: inputs-required
inputs:
  target:
    type: string
jobs:
  main:
    steps:
      - id: echo
        run: echo ${{ inputs.target | shell_quote }}
"#,
    );
    let graph = compile(&workflow, &registry).expect("compiles");
    let mut runner = WorkflowRunner::new(registry, ExecutionContext::new());
    let err = runner.run(&graph, Map::new()).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidInput { .. }));
}

#[test]
fn inputs_are_coerced_before_execution() {
    let (result, _) = run_yaml(
        r#"
schema_version: "1.0"
name: inputs-coerced
inputs:
  count:
    type: integer
  verbose:
    type: boolean
    default: "no"
jobs:
  main:
    steps:
      - id: echo
        run: echo ${{ inputs.count + 1 }}
"#,
        json!({"count": "41"}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_state["inputs"]["count"], json!(41));
    assert_eq!(result.final_state["inputs"]["verbose"], json!(false));
    assert_eq!(result.final_state["steps"]["echo"]["outputs"]["stdout"], json!("42\n"));
}

#[test]
fn identical_runs_reproduce_the_step_sequence() {
    let yaml = r#"
schema_version: "1.0"
name: deterministic
jobs:
  main:
    steps:
      - id: a
        run: "true"
      - id: b
        if: "${{ 1 == 2 }}"
        run: echo no
      - id: c
        loop: "${{ [1, 2] }}"
        run: echo ${{ loop.item }}
"#;
    let (first, _) = run_yaml(yaml, json!({}));
    let (second, _) = run_yaml(yaml, json!({}));
    assert_eq!(first.step_sequence, second.step_sequence);
}
