use flowstone::error::WorkflowError;
use flowstone::evaluator::security::PathValidator;
use flowstone::evaluator::Evaluator;
use serde_json::{json, Map, Value};
use std::fs;

fn evaluator_with(ctx: Value) -> Evaluator {
    let Value::Object(map) = ctx else {
        panic!("context must be an object");
    };
    Evaluator::new(map)
}

fn sample() -> Evaluator {
    evaluator_with(json!({
        "inputs": {"target": "example.com", "count": 3, "flags": ["-v", "-x"]},
        "env": {"MODE": "fast"},
        "steps": {
            "scan": {
                "outcome": "success",
                "outputs": {"stdout": "80\n443\n", "ports": [80, 443]},
            }
        },
        "loop": Value::Null,
    }))
}

#[test]
fn native_types_survive_resolution() {
    let e = sample();
    assert_eq!(
        e.resolve("${{ steps.scan.outputs.ports }}").expect("value"),
        json!([80, 443])
    );
    assert_eq!(e.resolve("${{ inputs.count * 2 }}").expect("value"), json!(6));
    assert_eq!(
        e.resolve("${{ steps.scan.outputs.ports | length }}")
            .expect("value"),
        json!(2)
    );
}

#[test]
fn embedded_resolution_stringifies_each_expression() {
    let e = sample();
    let resolved = e
        .resolve("scan ${{ inputs.target }} in ${{ env.MODE }} mode")
        .expect("value");
    assert_eq!(resolved, json!("scan example.com in fast mode"));
}

#[test]
fn lines_and_in_list_compose() {
    let e = sample();
    assert!(e
        .evaluate_condition("${{ '80' | in_list(steps.scan.outputs.stdout | lines) }}")
        .expect("condition"));
    assert!(!e
        .evaluate_condition("${{ '8080' | in_list(steps.scan.outputs.stdout | lines) }}")
        .expect("condition"));
}

#[test]
fn undefined_chains_are_falsy_not_errors() {
    let e = sample();
    assert!(!e
        .evaluate_condition("${{ steps.nope.outputs.anything }}")
        .expect("condition"));
    assert_eq!(
        e.resolve("${{ steps.nope.outputs.anything | default('none') }}")
            .expect("value"),
        json!("none")
    );
}

#[test]
fn forbidden_patterns_are_rejected_everywhere() {
    let e = sample();
    for expr in [
        "${{ inputs.__class__ }}",
        "${{ ''.__class__.__mro__ }}",
        "${{ __import__('os') }}",
        "${{ eval('1') }}",
        "${{ subprocess }}",
        "${{ os.environ }}",
    ] {
        assert!(
            matches!(e.resolve(expr), Err(WorkflowError::BlockedExpression { .. })),
            "expected {expr} to be blocked"
        );
    }
}

#[test]
fn arbitrary_function_calls_are_rejected() {
    let e = sample();
    assert!(e.resolve("${{ getattr(inputs, 'target') }}").is_err());
    // `now()` is the single whitelisted helper.
    let now = e.resolve("${{ now() }}").expect("now value");
    assert!(now.as_str().expect("string").contains('T'));
}

#[test]
fn safe_path_confines_to_the_workspace() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(workspace.path().join("reports")).expect("mkdir");

    let mut ctx = Map::new();
    ctx.insert("inputs".to_string(), json!({"out": "reports/scan.txt", "bad": "../../etc/passwd"}));
    let e = Evaluator::new(ctx).with_workspace(workspace.path());

    let resolved = e
        .resolve("${{ inputs.out | safe_path }}")
        .expect("inside workspace");
    assert!(resolved.as_str().expect("string").ends_with("reports/scan.txt"));

    assert!(e.resolve("${{ inputs.bad | safe_path }}").is_err());
}

#[test]
fn safe_path_blocks_sensitive_components() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut ctx = Map::new();
    ctx.insert("inputs".to_string(), json!({"sneaky": ".git/config"}));
    let e = Evaluator::new(ctx).with_workspace(workspace.path());
    assert!(e.resolve("${{ inputs.sneaky | safe_path }}").is_err());
}

#[test]
fn path_validator_rejects_symlink_escapes() {
    let workspace = tempfile::tempdir().expect("workspace");
    let outside = tempfile::tempdir().expect("outside");
    // The validator also allows the system temp dir, so escape beyond it.
    let target = outside.path().join("target");
    fs::create_dir_all(&target).expect("mkdir");

    let validator = PathValidator::new(workspace.path());
    assert!(validator.validate("inside.txt").is_ok());
    // Anything under temp is allowed by default.
    assert!(validator.validate(&target.display().to_string()).is_ok());
    // But /etc is not.
    assert!(matches!(
        validator.validate("/etc/passwd"),
        Err(WorkflowError::PathTraversal { .. })
    ));
}

#[test]
fn file_exists_checks_the_filesystem() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("present.txt");
    fs::write(&file, b"x").expect("write");

    let mut ctx = Map::new();
    ctx.insert(
        "inputs".to_string(),
        json!({"present": file.display().to_string(), "absent": dir.path().join("absent").display().to_string()}),
    );
    let e = Evaluator::new(ctx);
    assert_eq!(
        e.resolve("${{ inputs.present | file_exists }}").expect("value"),
        json!(true)
    );
    assert_eq!(
        e.resolve("${{ inputs.absent | file_exists }}").expect("value"),
        json!(false)
    );
}

#[test]
fn github_actions_style_helpers() {
    let e = sample();
    assert!(e
        .evaluate_condition("${{ inputs.target | contains('example') }}")
        .expect("condition"));
    assert!(e
        .evaluate_condition("${{ inputs.target | startsWith('example') }}")
        .expect("condition"));
    assert!(e
        .evaluate_condition("${{ inputs.target | endsWith('.com') }}")
        .expect("condition"));
    assert_eq!(
        e.resolve("${{ 'port {0} on {1}' | format(80, inputs.target) }}")
            .expect("value"),
        json!("port 80 on example.com")
    );
    assert_eq!(
        e.resolve("${{ inputs.flags | toJSON }}").expect("value"),
        json!("[\"-v\",\"-x\"]")
    );
}
