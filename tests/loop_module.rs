use flowstone::actions::{ActionRegistry, ExecutionContext};
use flowstone::compiler::compile;
use flowstone::graph::LoopPlan;
use flowstone::parser::WorkflowParser;
use flowstone::runtime::{loops, ExecutionResult, ExecutionStatus, WorkflowRunner, WorkflowState};
use flowstone::schema::{ResultStorage, WorkflowDefinition};
use serde_json::{json, Map, Value};
use std::fs;

fn run_yaml(yaml: &str, inputs: Value) -> ExecutionResult {
    let parsed = WorkflowParser::new().parse_str(yaml).expect("yaml parses");
    let workflow = WorkflowDefinition::from_value(&parsed.document).expect("definition");
    let registry = ActionRegistry::with_builtins();
    let graph = compile(&workflow, &registry).expect("compiles");
    let mut runner = WorkflowRunner::new(registry, ExecutionContext::new());
    let inputs = match inputs {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    runner.run(&graph, inputs).expect("runs")
}

fn loop_outputs<'a>(result: &'a ExecutionResult, step_id: &str) -> &'a Value {
    &result.final_state["steps"][step_id]["outputs"]
}

#[test]
fn loop_iterates_in_order_and_aggregates_results() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loops
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ inputs.targets }}"
        run: echo ${{ loop.item | shell_quote }}
      - id: after
        run: echo after
"#,
        json!({"targets": ["a", "b", "c"]}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(3));
    assert_eq!(outputs["success_count"], json!(3));
    assert_eq!(outputs["reason"], json!("complete"));
    assert_eq!(outputs["break_early"], json!(false));

    let results = outputs["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["index"], json!(0));
    assert_eq!(results[0]["item"], json!("a"));
    assert_eq!(results[2]["outputs"]["stdout"], json!("c\n"));
}

#[test]
fn file_storage_streams_results_to_jsonl() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-file
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1, 2, 3] }}"
        run: echo ${{ loop.item }}
        result_storage: file
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(3));
    assert_eq!(outputs["success_count"], json!(3));
    assert_eq!(outputs["reason"], json!("complete"));
    assert_eq!(outputs["results"], json!([]));

    let path = outputs["results_file"].as_str().expect("results_file");
    let content = fs::read_to_string(path).expect("jsonl readable");
    let lines: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1]["item"], json!(2));
    assert_eq!(lines[1]["outputs"]["stdout"], json!("2\n"));
    let _ = fs::remove_file(path);
}

#[test]
fn break_if_stops_after_the_matching_item() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-break
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1, 2, 3, 4] }}"
        run: echo ${{ loop.item }}
        break_if: "${{ loop.item == 2 }}"
"#,
        json!({}),
    );

    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["break_early"], json!(true));
    assert_eq!(outputs["break_index"], json!(1));
    assert_eq!(outputs["break_item"], json!(2));
    assert_eq!(outputs["count"], json!(2));
    assert_eq!(outputs["reason"], json!("break_if"));
    assert_eq!(result.final_state["steps"]["scan"]["outcome"], json!("success"));
}

#[test]
fn single_item_break_reports_index_zero() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-single
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [7] }}"
        run: echo ${{ loop.item }}
        break_if: "${{ true }}"
"#,
        json!({}),
    );

    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["break_early"], json!(true));
    assert_eq!(outputs["break_index"], json!(0));
    assert_eq!(outputs["break_item"], json!(7));
    assert_eq!(outputs["count"], json!(1));
}

#[test]
fn empty_collection_skips_the_body_entirely() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-empty
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [] }}"
        run: echo ${{ loop.item }}
      - id: after
        run: echo after
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(0));
    assert_eq!(outputs["reason"], json!("empty"));
    assert!(result.final_state["steps"].get("scan_body").is_none());
    assert_eq!(result.final_state["steps"]["after"]["outcome"], json!("success"));
}

#[test]
fn continue_on_error_collects_failures_as_partial() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-partial
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1, 2, 3] }}"
        run: exit 1
        continue_on_error: true
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_state["steps"]["scan"]["outcome"], json!("partial"));
    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(3));
    assert_eq!(outputs["success_count"], json!(0));
    assert_eq!(outputs["errors"].as_array().expect("errors").len(), 3);
}

#[test]
fn first_failure_aborts_without_continue_on_error() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-abort
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1, 2, 3] }}"
        run: exit 1
      - id: after
        run: echo after
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.final_state["steps"]["scan"]["outcome"], json!("failure"));
    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(1));
    assert!(result.final_state["steps"].get("after").is_none());
}

#[test]
fn loop_failure_routes_to_on_failure_handler() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-handled
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1] }}"
        run: exit 1
        on_failure: recover
      - id: recover
        run: echo recovered
"#,
        json!({}),
    );

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_state["steps"]["scan"]["outcome"], json!("failure"));
    assert_eq!(result.final_state["steps"]["recover"]["outcome"], json!("success"));
}

#[test]
fn max_iterations_bounds_the_cycle() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-bounded
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ [1, 2, 3, 4, 5, 6, 7, 8] }}"
        run: echo ${{ loop.item }}
        max_iterations: 3
"#,
        json!({}),
    );

    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["reason"], json!("max_iterations"));
    assert_eq!(outputs["count"], json!(3));
    assert_eq!(outputs["success_count"], json!(3));
}

#[test]
fn scalar_loop_source_becomes_one_iteration() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-scalar
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ 42 }}"
        run: echo ${{ loop.item }}
"#,
        json!({}),
    );

    let outputs = loop_outputs(&result, "scan");
    assert_eq!(outputs["count"], json!(1));
    let results = outputs["results"].as_array().expect("results");
    assert_eq!(results[0]["item"], json!(42));
}

#[test]
fn loop_frame_exposes_jinja_style_positions() {
    let result = run_yaml(
        r#"
schema_version: "1.0"
name: loop-frame
jobs:
  main:
    steps:
      - id: scan
        loop: "${{ ['x', 'y'] }}"
        run: echo "${{ loop.index }}/${{ loop.total }} first=${{ loop.first }} last=${{ loop.last }}"
"#,
        json!({}),
    );

    let results = loop_outputs(&result, "scan")["results"]
        .as_array()
        .expect("results")
        .clone();
    assert_eq!(results[0]["outputs"]["stdout"], json!("1/2 first=true last=false\n"));
    assert_eq!(results[1]["outputs"]["stdout"], json!("2/2 first=false last=true\n"));
}

fn plan(step_id: &str) -> LoopPlan {
    LoopPlan {
        step_id: step_id.to_string(),
        items_source: json!("${{ inputs.items }}"),
        break_if: None,
        max_iterations: 100,
        max_results: 100,
        max_errors: 50,
        continue_on_error: false,
        aggregate_results: true,
        result_storage: ResultStorage::Memory,
        result_file_dir: None,
        on_done: "__cleanup__".to_string(),
        has_failure_handler: false,
    }
}

#[test]
fn nested_init_links_parent_and_finalize_restores_it() {
    let exec = ExecutionContext::new();
    let mut initial = Map::new();
    initial.insert("inputs".to_string(), json!({"items": ["o1", "o2"]}));
    initial.insert("env".to_string(), json!({}));
    initial.insert("steps".to_string(), json!({}));
    let mut state = WorkflowState::new(initial);

    let outer = plan("outer");
    loops::run_init(&outer, &mut state, &exec).expect("outer init");
    let outer_frame = state.get("loop").cloned().expect("outer frame");
    assert_eq!(outer_frame["item"], json!("o1"));
    assert_eq!(outer_frame["parent"], Value::Null);

    let mut inner = plan("inner");
    inner.items_source = json!("${{ ['i1'] }}");
    loops::run_init(&inner, &mut state, &exec).expect("inner init");
    let inner_frame = state.get("loop").cloned().expect("inner frame");
    assert_eq!(inner_frame["item"], json!("i1"));
    assert_eq!(inner_frame["parent"]["item"], json!("o1"));
    assert_eq!(
        state.get("__loop_stack").cloned(),
        Some(json!(["outer", "inner"]))
    );

    loops::run_finalize(&inner, &mut state).expect("inner finalize");
    let restored = state.get("loop").cloned().expect("restored frame");
    assert_eq!(restored["item"], json!("o1"));
    assert_eq!(state.get("__loop_stack").cloned(), Some(json!(["outer"])));
}

#[test]
fn result_storage_rejects_directories_outside_the_whitelist() {
    let exec = ExecutionContext::new();
    let mut initial = Map::new();
    initial.insert("inputs".to_string(), json!({"items": [1]}));
    initial.insert("env".to_string(), json!({}));
    initial.insert("steps".to_string(), json!({}));
    let mut state = WorkflowState::new(initial);

    let mut bad = plan("bad");
    bad.result_storage = ResultStorage::File;
    bad.result_file_dir = Some("/etc".to_string());
    let err = loops::run_init(&bad, &mut state, &exec).unwrap_err();
    assert!(err.to_string().contains("result"), "unexpected error: {err}");
}
