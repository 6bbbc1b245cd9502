//! Input coercion against declared definitions at workflow start.

use crate::error::WorkflowError;
use crate::evaluator::stringify;
use crate::schema::{InputDefinition, InputType};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Coerce provided inputs to their declared types and check enum/pattern
/// constraints. Without declarations the inputs pass through unchanged;
/// with declarations, undeclared inputs are dropped.
pub fn coerce_inputs(
    definitions: &BTreeMap<String, InputDefinition>,
    provided: Map<String, Value>,
) -> Result<Map<String, Value>, WorkflowError> {
    if definitions.is_empty() {
        return Ok(provided);
    }

    let mut coerced = Map::new();
    for (name, definition) in definitions {
        let value = match provided.get(name) {
            Some(value) if !value.is_null() => value.clone(),
            _ => match &definition.default {
                Some(default) => default.clone(),
                None if definition.required => {
                    return Err(WorkflowError::InvalidInput {
                        name: name.clone(),
                        reason: "required input is missing".to_string(),
                    });
                }
                None => {
                    coerced.insert(name.clone(), Value::Null);
                    continue;
                }
            },
        };

        let value = coerce_value(name, value, definition.input_type)?;

        if let Some(allowed) = &definition.allowed_values {
            if !allowed.iter().any(|candidate| candidate == &value) {
                return Err(WorkflowError::InvalidInput {
                    name: name.clone(),
                    reason: format!(
                        "value `{}` is not one of the allowed values",
                        stringify(&value)
                    ),
                });
            }
        }

        if let Some(pattern) = &definition.pattern {
            if definition.input_type == InputType::String {
                let anchored = format!("^(?:{pattern})");
                let regex = Regex::new(&anchored).map_err(|err| WorkflowError::InvalidInput {
                    name: name.clone(),
                    reason: format!("invalid pattern constraint: {err}"),
                })?;
                let text = stringify(&value);
                if !regex.is_match(&text) {
                    return Err(WorkflowError::InvalidInput {
                        name: name.clone(),
                        reason: format!("value `{text}` does not match pattern `{pattern}`"),
                    });
                }
            }
        }

        coerced.insert(name.clone(), value);
    }
    Ok(coerced)
}

fn coerce_value(name: &str, value: Value, target: InputType) -> Result<Value, WorkflowError> {
    let invalid = |reason: String| WorkflowError::InvalidInput {
        name: name.to_string(),
        reason,
    };

    match target {
        InputType::String => Ok(Value::String(stringify(&value))),
        InputType::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(int) = trimmed.parse::<i64>() {
                    return Ok(Value::from(int));
                }
                trimmed
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| invalid(format!("cannot convert `{s}` to number")))
            }
            other => Err(invalid(format!("cannot convert {other} to number"))),
        },
        InputType::Integer => match &value {
            Value::Bool(_) => Err(invalid("cannot convert boolean to integer".to_string())),
            Value::Number(n) => {
                if let Some(int) = n.as_i64() {
                    Ok(Value::from(int))
                } else if let Some(float) = n.as_f64() {
                    if float.fract() == 0.0 {
                        Ok(Value::from(float as i64))
                    } else {
                        Err(invalid(format!("float {float} is not an integer")))
                    }
                } else {
                    Err(invalid("number out of integer range".to_string()))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid(format!("cannot convert `{s}` to integer"))),
            other => Err(invalid(format!("cannot convert {other} to integer"))),
        },
        InputType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "no" | "0" | "off" => Ok(Value::Bool(false)),
                other => Err(invalid(format!("cannot convert `{other}` to boolean"))),
            },
            Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
            other => Err(invalid(format!("cannot convert {other} to boolean"))),
        },
        InputType::Array => match &value {
            Value::Array(_) => Ok(value),
            Value::String(s) => {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
                    return Ok(Value::Array(items));
                }
                // Comma-split fallback for plain strings.
                Ok(Value::Array(
                    s.split(',')
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect(),
                ))
            }
            other => Err(invalid(format!("cannot convert {other} to array"))),
        },
        InputType::Object => match &value {
            Value::Object(_) => Ok(value),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Ok(Value::Object(map)),
                _ => Err(invalid("cannot parse string as JSON object".to_string())),
            },
            other => Err(invalid(format!("cannot convert {other} to object"))),
        },
    }
}
