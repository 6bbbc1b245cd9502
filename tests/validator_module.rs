use flowstone::parser::{ParsedWorkflow, WorkflowParser};
use flowstone::validator::{validate_workflow, ValidationLevel};

fn parse(yaml: &str) -> ParsedWorkflow {
    WorkflowParser::new().parse_str(yaml).expect("yaml parses")
}

const VALID: &str = r#"
schema_version: "1.0"
name: demo
jobs:
  main:
    steps:
      - id: fetch
        run: curl -s ${{ inputs.url | shell_quote }}
        timeout: 30
        on_failure: report
      - id: report
        run: echo failed
        timeout: 5
        continue_on_error: true
"#;

#[test]
fn a_well_formed_workflow_validates() {
    let result = validate_workflow(&parse(VALID), false);
    assert!(result.valid, "unexpected messages: {:?}", result.messages);
    assert_eq!(result.errors().count(), 0);
}

#[test]
fn schema_version_is_required_and_checked() {
    let result = validate_workflow(
        &parse("name: x\njobs:\n  main:\n    steps:\n      - run: echo hi\n"),
        false,
    );
    assert!(!result.valid);
    assert!(result.has_code("E000"));

    let result = validate_workflow(
        &parse("schema_version: \"9.9\"\nname: x\njobs:\n  main:\n    steps:\n      - run: echo hi\n"),
        false,
    );
    assert!(result.has_code("E000"));
}

#[test]
fn structural_errors_carry_codes_and_locations() {
    let result = validate_workflow(&parse("schema_version: \"1.0\"\njobs: {}\n"), false);
    assert!(result.has_code("E001"));
    assert!(result.has_code("E003"));

    let result = validate_workflow(
        &parse("schema_version: \"1.0\"\nname: x\njobs:\n  main:\n    steps: []\n"),
        false,
    );
    assert!(result.has_code("E005"));
    let message = result.errors().next().expect("one error");
    assert!(message.location.is_some());
}

#[test]
fn steps_need_exactly_one_action_selector() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: neither
        timeout: 5
      - id: both
        run: echo hi
        uses: control/exit
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(result.has_code("E013"));
    assert!(result.has_code("W007"));
}

#[test]
fn duplicate_and_reserved_ids_are_rejected() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: a
        run: echo one
      - id: a
        run: echo two
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(result.has_code("E007"));
}

#[test]
fn unknown_references_are_errors() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: a
        run: echo hi
        on_failure: ghost
      - id: b
        run: echo ${{ steps.phantom.outputs.stdout }}
"#;
    let result = validate_workflow(&parse(yaml), false);
    let e008: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.code == "E008")
        .collect();
    assert_eq!(e008.len(), 2);
}

#[test]
fn cleanup_is_a_valid_failure_target() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: a
        run: echo hi
        on_failure: __cleanup__
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(!result.has_code("E008"));
}

#[test]
fn dangerous_expressions_are_blocked() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: a
        run: echo ${{ inputs.x.__class__ }}
      - id: b
        uses: control/exit
        with:
          message: "${{ open('/etc/passwd') }}"
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(result.has_code("E010"));
    assert!(result.messages.iter().filter(|m| m.code == "E010").count() >= 2);
}

#[test]
fn bracket_balance_is_checked() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: a
        uses: control/exit
        with:
          message: "${{ (1 + 2 }}"
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(result.has_code("E009"));
}

#[test]
fn unquoted_shell_interpolation_warns() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: risky
        run: echo ${{ inputs.target }}
      - id: safe
        run: echo ${{ inputs.target | shell_quote }}
"#;
    let result = validate_workflow(&parse(yaml), false);
    let w008: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.code == "W008")
        .collect();
    assert_eq!(w008.len(), 1);
    assert!(w008[0].path.as_deref().expect("path").contains("steps[0]"));
}

#[test]
fn loop_sanity_warnings() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: big
        loop: "${{ inputs.items }}"
        run: echo hi
        max_iterations: 500000
      - id: forever
        loop: true
        run: echo hi
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert_eq!(
        result.messages.iter().filter(|m| m.code == "W003").count(),
        2
    );
}

#[test]
fn hardcoded_secrets_warn() {
    let yaml = r#"
schema_version: "1.0"
name: x
env:
  AUTH: 'password: "hunter2-is-long"'
jobs:
  main:
    steps:
      - id: a
        run: echo hi
"#;
    let result = validate_workflow(&parse(yaml), false);
    assert!(result.has_code("W005"));
}

#[test]
fn strict_mode_promotes_warnings_to_errors() {
    let yaml = r#"
schema_version: "1.0"
name: x
jobs:
  main:
    steps:
      - id: risky
        run: echo ${{ inputs.target }}
"#;
    let lenient = validate_workflow(&parse(yaml), false);
    assert!(lenient.valid);

    let strict = validate_workflow(&parse(yaml), true);
    assert!(!strict.valid);
    assert!(strict
        .messages
        .iter()
        .any(|m| m.code == "W008" && m.level == ValidationLevel::Error));
}
