//! Sandboxed `${{ … }}` expression evaluation.
//!
//! Expressions are parsed by a fixed-grammar interpreter and evaluated
//! against the workflow context (`inputs`, `env`, `steps`, `loop`); there is
//! no host-language eval anywhere. Native types are preserved: a list stays
//! a list, an integer stays an integer. The only callable function is
//! `now()`; everything else goes through the whitelisted filter set.

mod ast;
pub mod filters;
mod lexer;
pub mod security;

use crate::error::WorkflowError;
use ast::{parse_expression, BinaryOp, Expr, UnaryOp};
use security::ExpressionGuard;
use serde_json::{Map, Number, Value};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Evaluator {
    ctx: Map<String, Value>,
    workspace: Option<PathBuf>,
    guard: ExpressionGuard,
}

impl Evaluator {
    pub fn new(ctx: Map<String, Value>) -> Self {
        Self {
            ctx,
            workspace: None,
            guard: ExpressionGuard::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn update_context(&mut self, updates: Map<String, Value>) {
        for (key, value) in updates {
            self.ctx.insert(key, value);
        }
    }

    pub fn set_context(&mut self, ctx: Map<String, Value>) {
        self.ctx = ctx;
    }

    /// Resolve a string that may be a full expression, contain embedded
    /// expressions, or be plain text.
    ///
    /// A string that is exactly one `${{ … }}` resolves to the native value;
    /// embedded expressions are substituted as strings, with failures
    /// degrading to empty string.
    pub fn resolve(&self, text: &str) -> Result<Value, WorkflowError> {
        if is_single_expression(text) {
            let inner = text[3..text.len() - 2].trim();
            self.guard.check(inner)?;
            return self.eval_str(inner);
        }
        if !text.contains("${{") {
            return Ok(Value::String(text.to_string()));
        }
        Ok(Value::String(self.resolve_embedded(text)?))
    }

    /// Recursively resolve expressions in a data structure.
    pub fn resolve_all(&self, data: &Value) -> Result<Value, WorkflowError> {
        match data {
            Value::String(text) => self.resolve(text),
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve_all(value)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => {
                let resolved: Result<Vec<_>, _> =
                    items.iter().map(|item| self.resolve_all(item)).collect();
                Ok(Value::Array(resolved?))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate an expression as a boolean condition.
    pub fn evaluate_condition(&self, text: &str) -> Result<bool, WorkflowError> {
        let value = self.resolve(text)?;
        Ok(condition_truthy(&value))
    }

    fn resolve_embedded(&self, text: &str) -> Result<String, WorkflowError> {
        let mut result = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("${{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let Some(end) = after.find("}}") else {
                // Unterminated marker: keep the remainder verbatim.
                result.push_str(&rest[start..]);
                return Ok(result);
            };
            let inner = after[..end].trim();
            self.guard.check(inner)?;
            match self.eval_str(inner) {
                Ok(Value::Null) => {}
                Ok(value) => result.push_str(&stringify(&value)),
                // Embedded-expression failures degrade to empty string.
                Err(_) => {}
            }
            rest = &after[end + 2..];
        }
        result.push_str(rest);
        Ok(result)
    }

    fn eval_str(&self, inner: &str) -> Result<Value, WorkflowError> {
        let expr = parse_expression(inner)
            .map_err(|message| WorkflowError::expression(inner, message))?;
        self.eval(&expr)
            .map_err(|message| WorkflowError::expression(inner, message))
    }

    fn eval(&self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => {
                let values: Result<Vec<_>, _> = items.iter().map(|item| self.eval(item)).collect();
                Ok(Value::Array(values?))
            }
            Expr::Var(name) => {
                deny_dunder(name)?;
                Ok(self.ctx.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Attr(base, name) => {
                deny_dunder(name)?;
                let base = self.eval(base)?;
                // `list.0` indexes like `list[0]`.
                if base.is_array() {
                    if let Ok(index) = name.parse::<i64>() {
                        return Ok(lookup_index(&base, &Number::from(index)));
                    }
                }
                Ok(lookup_attr(&base, name))
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match &index {
                    Value::String(key) => {
                        deny_dunder(key)?;
                        Ok(lookup_attr(&base, key))
                    }
                    Value::Number(n) => Ok(lookup_index(&base, n)),
                    _ => Err("index must be a string or integer".to_string()),
                }
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!condition_truthy(&value))),
                    UnaryOp::Neg => negate(&value),
                }
            }
            Expr::Binary(op, left, right) => self.eval_binary(*op, left, right),
            Expr::Filter { input, name, args } => {
                let input = self.eval(input)?;
                let args: Result<Vec<_>, _> = args.iter().map(|arg| self.eval(arg)).collect();
                filters::apply_filter(name, &input, &args?, self.workspace.as_deref())
            }
            Expr::Call { name, args } => match name.as_str() {
                "now" if args.is_empty() => {
                    Ok(Value::String(chrono::Utc::now().to_rfc3339()))
                }
                "now" => Err("now() takes no arguments".to_string()),
                other => Err(format!("function `{other}` is not callable")),
            },
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, String> {
        // `and`/`or` short-circuit and return the deciding operand.
        if op == BinaryOp::And {
            let left = self.eval(left)?;
            if !condition_truthy(&left) {
                return Ok(left);
            }
            return self.eval(right);
        }
        if op == BinaryOp::Or {
            let left = self.eval(left)?;
            if condition_truthy(&left) {
                return Ok(left);
            }
            return self.eval(right);
        }

        let left = self.eval(left)?;
        let right = self.eval(right)?;
        match op {
            BinaryOp::Add => add_values(&left, &right),
            BinaryOp::Sub => arithmetic(&left, &right, "-", |a, b| a - b, |a, b| a.checked_sub(b)),
            BinaryOp::Mul => arithmetic(&left, &right, "*", |a, b| a * b, |a, b| a.checked_mul(b)),
            BinaryOp::Div => {
                let divisor = as_number(&right, "/")?;
                if divisor == 0.0 {
                    return Err("division by zero".to_string());
                }
                Ok(number(as_number(&left, "/")? / divisor))
            }
            BinaryOp::Mod => {
                match (left.as_i64(), right.as_i64()) {
                    (Some(a), Some(b)) if b != 0 => Ok(Value::from(a.rem_euclid(b))),
                    (Some(_), Some(_)) => Err("modulo by zero".to_string()),
                    _ => {
                        let divisor = as_number(&right, "%")?;
                        if divisor == 0.0 {
                            return Err("modulo by zero".to_string());
                        }
                        Ok(number(as_number(&left, "%")?.rem_euclid(divisor)))
                    }
                }
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = compare(&left, &right)?;
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
            BinaryOp::In => Ok(Value::Bool(match &right {
                Value::Array(items) => items.iter().any(|item| values_equal(item, &left)),
                Value::String(haystack) => haystack.contains(stringify(&left).as_str()),
                Value::Object(map) => map.contains_key(stringify(&left).as_str()),
                _ => false,
            })),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }
}

fn is_single_expression(text: &str) -> bool {
    text.starts_with("${{")
        && text.ends_with("}}")
        && text.matches("${{").count() == 1
        // The first closing marker must be the terminal one.
        && text[3..].find("}}").map(|end| end + 3 + 2 == text.len()) == Some(true)
}

fn deny_dunder(name: &str) -> Result<(), String> {
    if name.starts_with("__") {
        return Err(format!("access to `{name}` is blocked"));
    }
    Ok(())
}

fn lookup_attr(base: &Value, name: &str) -> Value {
    match base {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        // Chained access on missing values resolves to null.
        _ => Value::Null,
    }
}

fn lookup_index(base: &Value, index: &Number) -> Value {
    let Value::Array(items) = base else {
        return Value::Null;
    };
    let Some(index) = index.as_i64() else {
        return Value::Null;
    };
    let resolved = if index < 0 {
        items.len() as i64 + index
    } else {
        index
    };
    if resolved < 0 {
        return Value::Null;
    }
    items.get(resolved as usize).cloned().unwrap_or(Value::Null)
}

/// Condition truthiness: empty string, empty collection, `false`, `"false"`,
/// `"0"`, `"no"`, `"none"`, zero, and undefined are false.
pub fn condition_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let lowered = s.to_lowercase();
            !matches!(lowered.as_str(), "" | "false" | "0" | "no" | "none")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    condition_truthy(value)
}

/// Render a value for string interpolation: strings verbatim, null empty,
/// everything else compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    use std::cmp::Ordering;
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).ok_or_else(|| "values are not comparable".to_string());
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(format!(
        "cannot compare {} with {}",
        filters::type_name(a),
        filters::type_name(b)
    ))
}

fn as_number(value: &Value, op: &str) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("`{op}` expects numbers, got {}", filters::type_name(value)))
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn negate(value: &Value) -> Result<Value, String> {
    if let Some(i) = value.as_i64() {
        return Ok(Value::from(-i));
    }
    value
        .as_f64()
        .map(|f| Value::from(-f))
        .ok_or_else(|| format!("cannot negate {}", filters::type_name(value)))
}

fn add_values(left: &Value, right: &Value) -> Result<Value, String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::Array(joined))
        }
        _ => {
            if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Ok(Value::from(sum));
                }
            }
            Ok(number(as_number(left, "+")? + as_number(right, "+")?))
        }
    }
}

fn arithmetic(
    left: &Value,
    right: &Value,
    op: &str,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, String> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
    }
    Ok(number(float_op(as_number(left, op)?, as_number(right, op)?)))
}
