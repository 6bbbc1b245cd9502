use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Step ids that would collide with synthetic graph nodes or state keys.
pub const RESERVED_IDS: &[&str] = &[
    "__cleanup__",
    "__end__",
    "__start__",
    "__error__",
    "loop",
    "inputs",
    "env",
    "steps",
    "workflow",
];

pub const RESERVED_PREFIXES: &[&str] = &["__", "_internal_"];

pub const MAX_STEP_ID_LEN: usize = 64;

pub fn validate_step_id(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("step id must be non-empty".to_string());
    }
    if RESERVED_IDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(value))
    {
        return Err(format!("step id `{value}` is reserved"));
    }
    for prefix in RESERVED_PREFIXES {
        if value.starts_with(prefix) {
            return Err(format!("step id `{value}` cannot start with `{prefix}`"));
        }
    }
    if value.len() > MAX_STEP_ID_LEN {
        let prefix: String = value.chars().take(20).collect();
        return Err(format!(
            "step id `{prefix}…` exceeds max length ({MAX_STEP_ID_LEN})"
        ));
    }
    let mut chars = value.chars();
    let first = chars.next().expect("non-empty checked above");
    if !first.is_ascii_alphabetic() {
        return Err(format!("step id `{value}` must start with a letter"));
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-') {
        return Err(format!(
            "step id `{value}` may only contain ASCII letters, digits, `_` or `-`"
        ));
    }
    Ok(())
}

/// Derive a step id from a display name, as `{slug}_{index}`.
pub fn slug_from_name(name: &str, index: usize) -> String {
    let mut slug: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !slug.starts_with(|ch: char| ch.is_ascii_alphabetic()) {
        slug.insert(0, 's');
    }
    format!("{slug}_{index}")
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_step_id(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::borrow::Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(|err| D::Error::custom(format!("invalid step id `{raw}`: {err}")))
    }
}
