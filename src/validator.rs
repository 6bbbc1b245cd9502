//! Static workflow validation with stable, IDE-friendly error codes.
//!
//! All checks run before compilation against the raw parsed document, so
//! messages can point into the source file via the parser's `SourceMap`.

use crate::error::SourceLocation;
use crate::parser::{ParsedWorkflow, SourceMap};
use crate::schema::SUPPORTED_SCHEMA_VERSIONS;
use crate::shared::ids::{slug_from_name, validate_step_id};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone)]
pub struct ValidationMessage {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
    /// Document path, e.g. `jobs.main.steps[2]`.
    pub path: Option<String>,
    pub location: Option<SourceLocation>,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(location) = &self.location {
            write!(f, "{location}: ")?;
        }
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {suggestion})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub messages: Vec<ValidationMessage>,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            messages: Vec::new(),
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.level == ValidationLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.level == ValidationLevel::Warning)
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.messages.iter().any(|m| m.code == code)
    }
}

pub struct WorkflowValidator {
    strict: bool,
    expr_pattern: Regex,
    step_ref_pattern: Regex,
    dangerous_patterns: Vec<Regex>,
    secret_patterns: Vec<Regex>,
}

impl WorkflowValidator {
    pub fn new(strict: bool) -> Self {
        let dangerous = [
            r"__class__",
            r"__mro__",
            r"__subclasses__",
            r"__globals__",
            r"__builtins__",
            r"__import__",
            r"\beval\s*\(",
            r"\bexec\s*\(",
            r"\bcompile\s*\(",
            r"\bopen\s*\(",
            r"\bos\s*\.",
            r"\bsys\s*\.",
            r"\bsubprocess\b",
        ];
        let secrets = [
            r#"(?i)password\s*[=:]\s*['"][^'"]+['"]"#,
            r#"(?i)api[_-]?key\s*[=:]\s*['"][^'"]+['"]"#,
            r#"(?i)secret\s*[=:]\s*['"][^'"]+['"]"#,
            r#"(?i)token\s*[=:]\s*['"][^'"]+['"]"#,
            r"Bearer\s+[A-Za-z0-9\-._~+/]{16,}=*",
            r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----",
        ];
        Self {
            strict,
            expr_pattern: Regex::new(r"(?s)\$\{\{(.+?)\}\}").expect("expression pattern is valid"),
            step_ref_pattern: Regex::new(r"\bsteps\.([A-Za-z][A-Za-z0-9_-]*)")
                .expect("step reference pattern is valid"),
            dangerous_patterns: dangerous
                .iter()
                .map(|p| Regex::new(p).expect("dangerous pattern is valid"))
                .collect(),
            secret_patterns: secrets
                .iter()
                .map(|p| Regex::new(p).expect("secret pattern is valid"))
                .collect(),
        }
    }

    pub fn validate(&self, parsed: &ParsedWorkflow) -> ValidationResult {
        let mut result = ValidationResult::new();
        let document = &parsed.document;
        let sources = &parsed.source_map;

        self.check_structure(document, sources, &mut result);
        if !result.valid {
            return self.finish(result);
        }

        let steps = steps_of(document);
        let step_ids = self.collect_step_ids(steps, sources, &mut result);
        self.check_steps(steps, sources, &mut result);
        self.check_references(steps, &step_ids, sources, &mut result);
        self.check_expressions(document, "workflow", &step_ids, sources, &mut result);
        self.check_shell_safety(steps, sources, &mut result);
        self.check_loops(steps, sources, &mut result);
        self.check_secrets(document, "workflow", sources, &mut result);

        self.finish(result)
    }

    fn finish(&self, mut result: ValidationResult) -> ValidationResult {
        if self.strict {
            for message in &mut result.messages {
                if message.level == ValidationLevel::Warning {
                    message.level = ValidationLevel::Error;
                    result.valid = false;
                }
            }
        }
        result
    }

    fn check_structure(&self, document: &Value, sources: &SourceMap, result: &mut ValidationResult) {
        match document.get("schema_version") {
            None => error(
                result,
                sources,
                "E000",
                "workflow must have a `schema_version` field",
                "workflow",
                Some("add `schema_version: \"1.0\"` at the top level"),
            ),
            Some(version) => {
                let version = match version {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !SUPPORTED_SCHEMA_VERSIONS.contains(&version.as_str()) {
                    error(
                        result,
                        sources,
                        "E000",
                        &format!("unsupported schema version `{version}`"),
                        "schema_version",
                        Some(&format!(
                            "supported versions: {}",
                            SUPPORTED_SCHEMA_VERSIONS.join(", ")
                        )),
                    );
                }
            }
        }

        if document
            .get("name")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true)
        {
            error(
                result,
                sources,
                "E001",
                "workflow must have a `name` field",
                "workflow",
                Some("add `name: my-workflow` at the top level"),
            );
        }

        let Some(jobs) = document.get("jobs") else {
            error(
                result,
                sources,
                "E002",
                "workflow must have a `jobs` section",
                "workflow",
                Some("add a `jobs:` section with a `main` job"),
            );
            return;
        };
        let Some(jobs) = jobs.as_object() else {
            error(result, sources, "E014", "`jobs` must be a mapping", "jobs", None);
            return;
        };
        let Some(main) = jobs.get("main") else {
            error(
                result,
                sources,
                "E003",
                "workflow must have a `main` job",
                "jobs",
                Some("add `main:` under `jobs:`"),
            );
            return;
        };
        let Some(main) = main.as_object() else {
            error(result, sources, "E014", "`main` job must be a mapping", "jobs.main", None);
            return;
        };
        let Some(steps) = main.get("steps") else {
            error(
                result,
                sources,
                "E004",
                "main job must have a `steps` section",
                "jobs.main",
                None,
            );
            return;
        };
        let Some(steps) = steps.as_array() else {
            error(
                result,
                sources,
                "E014",
                "`steps` must be a sequence",
                "jobs.main.steps",
                None,
            );
            return;
        };
        if steps.is_empty() {
            error(
                result,
                sources,
                "E005",
                "workflow must have at least one step",
                "jobs.main.steps",
                None,
            );
        }
    }

    fn collect_step_ids(
        &self,
        steps: &[Value],
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for (index, step) in steps.iter().enumerate() {
            let path = format!("jobs.main.steps[{index}]");
            let Some(step) = step.as_object() else {
                error(
                    result,
                    sources,
                    "E006",
                    &format!("step at index {index} is not a mapping"),
                    &path,
                    None,
                );
                continue;
            };

            let step_id = match step.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => {
                    let generated = match step.get("name").and_then(Value::as_str) {
                        Some(name) => slug_from_name(name, index),
                        None => format!("step_{index}"),
                    };
                    info(
                        result,
                        sources,
                        "W002",
                        &format!("step at index {index} has no `id` field"),
                        &path,
                        Some(&format!("add `id: {generated}` for explicit identification")),
                    );
                    generated
                }
            };

            if let Err(reason) = validate_step_id(&step_id) {
                error(result, sources, "E006", &reason, &path, None);
            }

            if !ids.insert(step_id.clone()) {
                error(
                    result,
                    sources,
                    "E007",
                    &format!("duplicate step id `{step_id}`"),
                    &path,
                    Some("use a unique id for each step"),
                );
            }
        }
        ids
    }

    fn check_steps(&self, steps: &[Value], sources: &SourceMap, result: &mut ValidationResult) {
        for (index, step) in steps.iter().enumerate() {
            let Some(step) = step.as_object() else {
                continue;
            };
            let path = format!("jobs.main.steps[{index}]");
            let has_run = step.contains_key("run");
            let has_uses = step.contains_key("uses");

            if !has_run && !has_uses {
                error(
                    result,
                    sources,
                    "E013",
                    "step must have either `run` or `uses`",
                    &path,
                    Some("add `run: command` or `uses: action/type`"),
                );
            }
            if has_run && has_uses {
                warning(
                    result,
                    sources,
                    "W007",
                    "step has both `run` and `uses`; `run` takes precedence",
                    &path,
                    None,
                );
            }

            if let Some(condition) = step.get("if") {
                if !condition.is_string() {
                    error(
                        result,
                        sources,
                        "E014",
                        "`if` condition must be a string expression",
                        &path,
                        None,
                    );
                }
            }

            if has_run && !step.contains_key("timeout") {
                info(
                    result,
                    sources,
                    "W004",
                    "shell command has no timeout",
                    &path,
                    Some("add `timeout: 60` to bound hanging commands"),
                );
            }
            if has_run && !step.contains_key("on_failure") && !step.contains_key("continue_on_error")
            {
                info(
                    result,
                    sources,
                    "W006",
                    "step has no error handling",
                    &path,
                    Some("consider `on_failure: step_id` or `continue_on_error: true`"),
                );
            }
        }
    }

    fn check_references(
        &self,
        steps: &[Value],
        step_ids: &BTreeSet<String>,
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) {
        for (index, step) in steps.iter().enumerate() {
            let Some(step) = step.as_object() else {
                continue;
            };
            let path = format!("jobs.main.steps[{index}]");

            if let Some(target) = step.get("on_failure").and_then(Value::as_str) {
                if target != "__cleanup__" && !step_ids.contains(target) {
                    error(
                        result,
                        sources,
                        "E008",
                        &format!("`on_failure` references unknown step `{target}`"),
                        &format!("{path}.on_failure"),
                        Some(&format!(
                            "declared step ids: {}",
                            step_ids.iter().cloned().collect::<Vec<_>>().join(", ")
                        )),
                    );
                }
            }

            let needs: Vec<String> = match step.get("needs") {
                Some(Value::String(one)) => vec![one.clone()],
                Some(Value::Array(many)) => many
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            for need in needs {
                if !step_ids.contains(&need) {
                    error(
                        result,
                        sources,
                        "E008",
                        &format!("`needs` references unknown step `{need}`"),
                        &format!("{path}.needs"),
                        None,
                    );
                }
            }
        }
    }

    fn check_expressions(
        &self,
        value: &Value,
        path: &str,
        step_ids: &BTreeSet<String>,
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    self.check_expressions(nested, &format!("{path}.{key}"), step_ids, sources, result);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.check_expressions(
                        item,
                        &format!("{path}[{index}]"),
                        step_ids,
                        sources,
                        result,
                    );
                }
            }
            Value::String(text) => self.check_string_expressions(text, path, step_ids, sources, result),
            _ => {}
        }
    }

    fn check_string_expressions(
        &self,
        text: &str,
        path: &str,
        step_ids: &BTreeSet<String>,
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) {
        for capture in self.expr_pattern.captures_iter(text) {
            let expr = capture
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .trim();

            for pattern in &self.dangerous_patterns {
                if pattern.is_match(expr) {
                    error(
                        result,
                        sources,
                        "E010",
                        &format!("dangerous pattern `{}` in expression", pattern.as_str()),
                        path,
                        Some("use only safe expression constructs"),
                    );
                }
            }

            if let Err(reason) = check_bracket_balance(expr) {
                error(
                    result,
                    sources,
                    "E009",
                    &format!("invalid expression syntax: {reason}"),
                    path,
                    None,
                );
            }

            for reference in self.step_ref_pattern.captures_iter(expr) {
                let id = reference
                    .get(1)
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                if !step_ids.contains(id) {
                    error(
                        result,
                        sources,
                        "E008",
                        &format!("expression references unknown step `{id}`"),
                        path,
                        None,
                    );
                }
            }
        }
    }

    fn check_shell_safety(
        &self,
        steps: &[Value],
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) {
        for (index, step) in steps.iter().enumerate() {
            let Some(step) = step.as_object() else {
                continue;
            };
            let commands: Vec<&str> = match step.get("run") {
                Some(Value::String(one)) => vec![one.as_str()],
                Some(Value::Array(many)) => many.iter().filter_map(Value::as_str).collect(),
                _ => continue,
            };
            let path = format!("jobs.main.steps[{index}].run");

            for command in commands {
                for capture in self.expr_pattern.captures_iter(command) {
                    let expr = capture
                        .get(1)
                        .map(|m| m.as_str())
                        .unwrap_or_default();
                    if !expr.contains("shell_quote") {
                        warning(
                            result,
                            sources,
                            "W008",
                            &format!(
                                "unquoted expression in shell command: `${{{{{expr}}}}}`",
                            ),
                            &path,
                            Some(&format!(
                                "pipe it through shell_quote: ${{{{ {} | shell_quote }}}}",
                                expr.trim()
                            )),
                        );
                    }
                }
            }
        }
    }

    fn check_loops(&self, steps: &[Value], sources: &SourceMap, result: &mut ValidationResult) {
        for (index, step) in steps.iter().enumerate() {
            let Some(step) = step.as_object() else {
                continue;
            };
            let Some(loop_source) = step.get("loop") else {
                continue;
            };
            let path = format!("jobs.main.steps[{index}]");

            if loop_source.is_object() {
                error(
                    result,
                    sources,
                    "E012",
                    "`loop` must be an expression or a sequence",
                    &format!("{path}.loop"),
                    Some("use `loop: ${{ inputs.items }}`"),
                );
                continue;
            }

            let max_iterations = step
                .get("max_iterations")
                .and_then(Value::as_u64)
                .unwrap_or(crate::schema::DEFAULT_MAX_ITERATIONS);
            if max_iterations > 100_000 {
                warning(
                    result,
                    sources,
                    "W003",
                    &format!("very high max_iterations ({max_iterations}) may exhaust memory"),
                    &format!("{path}.max_iterations"),
                    Some("reduce max_iterations or use result_storage: file"),
                );
            }

            let is_infinite = match loop_source {
                Value::Bool(true) => true,
                Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
                _ => false,
            };
            if is_infinite && !step.contains_key("break_if") {
                warning(
                    result,
                    sources,
                    "W003",
                    "infinite loop with no break_if condition",
                    &format!("{path}.loop"),
                    Some("add `break_if: condition` to bound the loop"),
                );
            }
        }
    }

    fn check_secrets(
        &self,
        value: &Value,
        path: &str,
        sources: &SourceMap,
        result: &mut ValidationResult,
    ) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    self.check_secrets(nested, &format!("{path}.{key}"), sources, result);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.check_secrets(item, &format!("{path}[{index}]"), sources, result);
                }
            }
            Value::String(text) => {
                for pattern in &self.secret_patterns {
                    if pattern.is_match(text) {
                        warning(
                            result,
                            sources,
                            "W005",
                            "possible hardcoded secret detected",
                            path,
                            Some("use inputs or environment variables instead"),
                        );
                        break;
                    }
                }
            }
            _ => {}
        }
    }
}

pub fn validate_workflow(parsed: &ParsedWorkflow, strict: bool) -> ValidationResult {
    WorkflowValidator::new(strict).validate(parsed)
}

fn steps_of(document: &Value) -> &[Value] {
    document
        .get("jobs")
        .and_then(|jobs| jobs.get("main"))
        .and_then(|main| main.get("steps"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn check_bracket_balance(expr: &str) -> Result<(), String> {
    if expr.trim().is_empty() {
        return Err("empty expression".to_string());
    }
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    for ch in expr.chars() {
        if let Some(quote) = in_string {
            if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => in_string = Some(ch),
            '(' => stack.push(')'),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ')' | ']' | '}' => {
                if stack.pop() != Some(ch) {
                    return Err(format!("unbalanced bracket `{ch}`"));
                }
            }
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        return Err(format!("unclosed bracket `{open}`"));
    }
    Ok(())
}

fn push_message(
    result: &mut ValidationResult,
    sources: &SourceMap,
    level: ValidationLevel,
    code: &'static str,
    message: &str,
    path: &str,
    suggestion: Option<&str>,
) {
    if level == ValidationLevel::Error {
        result.valid = false;
    }
    result.messages.push(ValidationMessage {
        level,
        code,
        message: message.to_string(),
        path: Some(path.to_string()),
        location: sources.locate_nearest(path),
        suggestion: suggestion.map(str::to_string),
    });
}

fn error(
    result: &mut ValidationResult,
    sources: &SourceMap,
    code: &'static str,
    message: &str,
    path: &str,
    suggestion: Option<&str>,
) {
    push_message(result, sources, ValidationLevel::Error, code, message, path, suggestion);
}

fn warning(
    result: &mut ValidationResult,
    sources: &SourceMap,
    code: &'static str,
    message: &str,
    path: &str,
    suggestion: Option<&str>,
) {
    push_message(result, sources, ValidationLevel::Warning, code, message, path, suggestion);
}

fn info(
    result: &mut ValidationResult,
    sources: &SourceMap,
    code: &'static str,
    message: &str,
    path: &str,
    suggestion: Option<&str>,
) {
    push_message(result, sources, ValidationLevel::Info, code, message, path, suggestion);
}
