//! Whitelisted filter set for `${{ … }}` expressions.
//!
//! Only the names dispatched here are callable; anything else is rejected
//! by the evaluator. Filters operate on native values and preserve types.

use crate::evaluator::security::{expand_home, safe_path_filter};
use crate::evaluator::stringify;
use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;

pub fn apply_filter(
    name: &str,
    input: &Value,
    args: &[Value],
    workspace: Option<&Path>,
) -> Result<Value, String> {
    match name {
        // Collections
        "length" => Ok(match input {
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
            Value::Null => Value::from(0),
            _ => return Err("length expects a string, list, or mapping".to_string()),
        }),
        "keys" => Ok(match input {
            Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
            _ => Value::Array(Vec::new()),
        }),
        "values" => Ok(match input {
            Value::Object(map) => Value::Array(map.values().cloned().collect()),
            _ => Value::Array(Vec::new()),
        }),
        "first" => Ok(match input {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::String(s) => s
                .chars()
                .next()
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "last" => Ok(match input {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::String(s) => s
                .chars()
                .last()
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "join" => {
            let separator = args.first().map(stringify).unwrap_or_else(|| ",".to_string());
            let items = match input {
                Value::Array(items) => items
                    .iter()
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(&separator),
                Value::Null => String::new(),
                _ => return Err("join expects a list".to_string()),
            };
            Ok(Value::String(items))
        }
        "sort" => {
            let mut items = match input {
                Value::Array(items) => items.clone(),
                Value::Null => Vec::new(),
                _ => return Err("sort expects a list".to_string()),
            };
            items.sort_by(compare_values);
            Ok(Value::Array(items))
        }
        "unique" => {
            let items = match input {
                Value::Array(items) => items,
                Value::Null => return Ok(Value::Array(Vec::new())),
                _ => return Err("unique expects a list".to_string()),
            };
            let mut seen = Vec::new();
            for item in items {
                if !seen.contains(item) {
                    seen.push(item.clone());
                }
            }
            Ok(Value::Array(seen))
        }
        "in_list" => {
            let needle = stringify(input);
            let haystack = match args.first() {
                Some(Value::Array(items)) => items,
                _ => return Err("in_list expects a list argument".to_string()),
            };
            Ok(Value::Bool(
                haystack
                    .iter()
                    .any(|item| stringify(item).trim() == needle),
            ))
        }

        // Strings
        "lower" => Ok(Value::String(stringify(input).to_lowercase())),
        "upper" => Ok(Value::String(stringify(input).to_uppercase())),
        "trim" => Ok(Value::String(stringify(input).trim().to_string())),
        "split" => {
            let text = stringify(input);
            let parts: Vec<Value> = match args.first() {
                Some(sep) => text
                    .split(stringify(sep).as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                None => text
                    .split_whitespace()
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            };
            Ok(Value::Array(parts))
        }
        "lines" => Ok(Value::Array(
            stringify(input)
                .lines()
                .map(|line| Value::String(line.to_string()))
                .collect(),
        )),
        "truncate" => {
            let text = stringify(input);
            let length = args
                .first()
                .and_then(Value::as_u64)
                .unwrap_or(80) as usize;
            let suffix = args.get(1).map(stringify).unwrap_or_else(|| "...".to_string());
            if text.chars().count() <= length {
                return Ok(Value::String(text));
            }
            let keep = length.saturating_sub(suffix.chars().count());
            let truncated: String = text.chars().take(keep).collect();
            Ok(Value::String(format!("{truncated}{suffix}")))
        }
        "safe_filename" => Ok(Value::String(safe_filename(&stringify(input)))),
        "contains" => {
            let needle = args.first().cloned().unwrap_or(Value::Null);
            Ok(Value::Bool(match input {
                Value::String(s) => s.contains(stringify(&needle).as_str()),
                Value::Array(items) => items.contains(&needle),
                _ => false,
            }))
        }
        "startsWith" => {
            let prefix = args.first().map(stringify).unwrap_or_default();
            Ok(Value::Bool(stringify(input).starts_with(&prefix)))
        }
        "endsWith" => {
            let suffix = args.first().map(stringify).unwrap_or_default();
            Ok(Value::Bool(stringify(input).ends_with(&suffix)))
        }
        "format" => {
            let mut result = stringify(input);
            for (index, arg) in args.iter().enumerate() {
                result = result.replace(&format!("{{{index}}}"), &stringify(arg));
            }
            Ok(Value::String(result))
        }
        "regex_replace" => {
            let pattern = args
                .first()
                .map(stringify)
                .ok_or_else(|| "regex_replace expects a pattern".to_string())?;
            let replacement = args.get(1).map(stringify).unwrap_or_default();
            let regex = Regex::new(&pattern).map_err(|err| format!("invalid regex: {err}"))?;
            Ok(Value::String(
                regex
                    .replace_all(&stringify(input), replacement.as_str())
                    .into_owned(),
            ))
        }
        "regex_match" => {
            let pattern = args
                .first()
                .map(stringify)
                .ok_or_else(|| "regex_match expects a pattern".to_string())?;
            let regex = Regex::new(&pattern).map_err(|err| format!("invalid regex: {err}"))?;
            Ok(Value::Bool(regex.is_match(&stringify(input))))
        }

        // Type conversion and defaults
        "int" => Ok(Value::from(to_int(input)?)),
        "float" => Ok(Value::from(to_float(input)?)),
        "string" => Ok(Value::String(stringify(input))),
        "default" => {
            let fallback = args.first().cloned().unwrap_or(Value::String(String::new()));
            if input.is_null() {
                Ok(fallback)
            } else {
                Ok(input.clone())
            }
        }

        // Encoding
        "toJSON" | "json_encode" => serde_json::to_string(input)
            .map(Value::String)
            .map_err(|err| format!("json encoding failed: {err}")),
        "fromJSON" | "json_decode" => match input {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|err| format!("json decoding failed: {err}"))
            }
            other => Ok(other.clone()),
        },
        "base64_encode" => Ok(Value::String(
            base64::engine::general_purpose::STANDARD.encode(stringify(input)),
        )),
        "base64_decode" => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(stringify(input))
                .map_err(|err| format!("base64 decoding failed: {err}"))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|err| format!("decoded bytes are not utf-8: {err}"))
        }
        "url_encode" => Ok(Value::String(
            urlencoding::encode(&stringify(input)).into_owned(),
        )),
        "url_decode" => urlencoding::decode(&stringify(input))
            .map(|decoded| Value::String(decoded.into_owned()))
            .map_err(|err| format!("url decoding failed: {err}")),

        // Shell and path safety
        "shell_quote" => Ok(Value::String(shell_words::join([stringify(input)]))),
        "safe_path" => {
            let override_workspace = args.first().map(stringify);
            let workspace_buf = override_workspace.as_deref().map(Path::new);
            safe_path_filter(&stringify(input), workspace_buf.or(workspace))
                .map(Value::String)
                .map_err(|err| err.to_string())
        }

        // Network
        "extract_domain" => Ok(Value::String(extract_domain(&stringify(input)))),
        "extract_ip" => {
            let regex = Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")
                .expect("ip pattern is a valid regex");
            Ok(Value::Array(
                regex
                    .find_iter(&stringify(input))
                    .map(|m| Value::String(m.as_str().to_string()))
                    .collect(),
            ))
        }
        "is_valid_ip" => Ok(Value::Bool(
            stringify(input).parse::<IpAddr>().is_ok(),
        )),
        "is_private_ip" => Ok(Value::Bool(
            stringify(input)
                .parse::<IpAddr>()
                .map(|ip| is_private_ip(&ip))
                .unwrap_or(false),
        )),
        "in_cidr" => {
            let cidr = args
                .first()
                .map(stringify)
                .ok_or_else(|| "in_cidr expects a CIDR argument".to_string())?;
            Ok(Value::Bool(
                stringify(input)
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| in_cidr(&ip, &cidr))
                    .unwrap_or(false),
            ))
        }

        // Filesystem
        "file_exists" => Ok(Value::Bool(
            expand_home(&stringify(input)).is_file(),
        )),

        other => Err(format!("filter `{other}` is not in the allowed set")),
    }
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Null => Ok(0),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| "number out of range".to_string()),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .or_else(|_| trimmed.parse::<f64>().map(|f| f as i64))
                .map_err(|_| format!("cannot convert `{s}` to int"))
        }
        other => Err(format!("cannot convert {} to int", type_name(other))),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Null => Ok(0.0),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| "number out of range".to_string()),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("cannot convert `{s}` to float")),
        other => Err(format!("cannot convert {} to float", type_name(other))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => stringify(a).cmp(&stringify(b)),
    }
}

fn safe_filename(value: &str) -> String {
    let mut cleaned: String = value
        .chars()
        .filter(|ch| !ch.is_control())
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    cleaned = cleaned.trim_matches(['.', ' ']).to_string();
    if cleaned.len() > 255 {
        cleaned.truncate(255);
    }
    if cleaned.is_empty() {
        cleaned = "unnamed".to_string();
    }
    cleaned
}

fn extract_domain(url: &str) -> String {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    rest.split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}

fn in_cidr(ip: &IpAddr, cidr: &str) -> bool {
    let Some((network, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.trim().parse::<u32>() else {
        return false;
    };
    match (ip, network.trim().parse::<IpAddr>()) {
        (IpAddr::V4(ip), Ok(IpAddr::V4(net))) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            (u32::from(*ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), Ok(IpAddr::V6(net))) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            (u128::from(*ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(name: &str, input: Value, args: &[Value]) -> Value {
        apply_filter(name, &input, args, None).expect("filter")
    }

    #[test]
    fn shell_quote_produces_one_token() {
        let quoted = apply("shell_quote", json!("; rm -rf /"), &[]);
        let token = quoted.as_str().expect("string");
        let words = shell_words::split(token).expect("splits back");
        assert_eq!(words, vec!["; rm -rf /".to_string()]);
    }

    #[test]
    fn collection_filters_preserve_types() {
        assert_eq!(apply("length", json!([1, 2, 3]), &[]), json!(3));
        assert_eq!(apply("first", json!([7, 8]), &[]), json!(7));
        assert_eq!(
            apply("sort", json!([3, 1, 2]), &[]),
            json!([1, 2, 3])
        );
        assert_eq!(
            apply("unique", json!(["a", "b", "a"]), &[]),
            json!(["a", "b"])
        );
    }

    #[test]
    fn network_filters() {
        assert_eq!(apply("is_valid_ip", json!("10.0.0.1"), &[]), json!(true));
        assert_eq!(apply("is_private_ip", json!("10.0.0.1"), &[]), json!(true));
        assert_eq!(apply("is_private_ip", json!("8.8.8.8"), &[]), json!(false));
        assert_eq!(
            apply("in_cidr", json!("10.1.2.3"), &[json!("10.0.0.0/8")]),
            json!(true)
        );
        assert_eq!(
            apply("in_cidr", json!("11.1.2.3"), &[json!("10.0.0.0/8")]),
            json!(false)
        );
        assert_eq!(
            apply("extract_domain", json!("https://example.com/path"), &[]),
            json!("example.com")
        );
    }

    #[test]
    fn unknown_filters_are_rejected() {
        assert!(apply_filter("attr", &json!({}), &[], None).is_err());
    }

    #[test]
    fn json_round_trip() {
        let encoded = apply("toJSON", json!({"a": 1}), &[]);
        let decoded = apply("fromJSON", encoded, &[]);
        assert_eq!(decoded, json!({"a": 1}));
    }
}
