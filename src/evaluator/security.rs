//! Expression and path security checks.
//!
//! The expression guard is a defense-in-depth substring scan applied before
//! parsing; the interpreter additionally rejects dunder identifiers. The
//! path validator keeps filter-resolved paths inside the configured
//! workspace and away from sensitive locations.

use crate::error::WorkflowError;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// Forbidden fragments scanned in every expression before evaluation.
const FORBIDDEN_PATTERNS: &[&str] = &[
    r"__class__",
    r"__mro__",
    r"__subclasses__",
    r"__globals__",
    r"__builtins__",
    r"__import__",
    r"\b(?:eval|exec|compile|open)\s*\(",
    r"\b(?:os|sys)\s*\.",
    r"\bsubprocess\b",
];

#[derive(Debug)]
pub struct ExpressionGuard {
    patterns: Vec<Regex>,
}

impl ExpressionGuard {
    pub fn new() -> Self {
        let patterns = FORBIDDEN_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("forbidden pattern is a valid regex"))
            .collect();
        Self { patterns }
    }

    pub fn check(&self, expression: &str) -> Result<(), WorkflowError> {
        for pattern in &self.patterns {
            if pattern.is_match(expression) {
                return Err(WorkflowError::BlockedExpression {
                    pattern: pattern.as_str().to_string(),
                    expression: expression.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for ExpressionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Path components that are never valid write or read targets even inside
/// the workspace.
const SENSITIVE_COMPONENTS: &[&str] = &[".git", ".env", ".ssh", ".gnupg", ".aws", "secrets"];

#[derive(Debug, Clone)]
pub struct PathValidator {
    workspace: PathBuf,
    allowed_roots: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new(workspace: &Path) -> Self {
        let workspace = normalize(&absolute(workspace));
        let mut allowed_roots = vec![workspace.clone()];
        allowed_roots.push(normalize(&std::env::temp_dir()));
        Self {
            workspace,
            allowed_roots,
        }
    }

    pub fn allow_root(mut self, root: &Path) -> Self {
        self.allowed_roots.push(normalize(&absolute(root)));
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Validate that a path stays within the allowed roots, resolving
    /// symlinks on the deepest existing ancestor.
    pub fn validate(&self, raw: &str) -> Result<PathBuf, WorkflowError> {
        let expanded = expand_home(raw);
        let candidate = if expanded.is_absolute() {
            expanded
        } else {
            self.workspace.join(expanded)
        };
        let resolved = resolve_symlinks(&normalize(&candidate));

        let allowed = self.allowed_roots.iter().any(|root| {
            let root = resolve_symlinks(root);
            resolved.starts_with(&root)
        });
        if !allowed {
            return Err(WorkflowError::PathTraversal {
                path: raw.to_string(),
                allowed_base: self.workspace.display().to_string(),
            });
        }
        Ok(resolved)
    }

    /// Validate a write target: allowed roots plus the sensitive blocklist.
    pub fn validate_for_write(&self, raw: &str) -> Result<PathBuf, WorkflowError> {
        let path = self.validate(raw)?;
        for component in path.components() {
            if let Component::Normal(part) = component {
                let part = part.to_string_lossy();
                if SENSITIVE_COMPONENTS
                    .iter()
                    .any(|sensitive| part.eq_ignore_ascii_case(sensitive))
                {
                    return Err(WorkflowError::Security(format!(
                        "refusing to write to sensitive location `{}`",
                        path.display()
                    )));
                }
            }
        }
        Ok(path)
    }
}

/// Filter entry point: validate and return the path as a string.
pub fn safe_path_filter(value: &str, workspace: Option<&Path>) -> Result<String, WorkflowError> {
    let workspace = match workspace {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().map_err(|err| {
            WorkflowError::Security(format!("cannot resolve working directory: {err}"))
        })?,
    };
    let validated = PathValidator::new(&workspace).validate_for_write(value)?;
    Ok(validated.display().to_string())
}

pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    if raw == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(raw)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Lexically normalize `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// Canonicalize the deepest existing ancestor so symlinked prefixes cannot
/// smuggle a path outside the allowed roots, then reattach the remainder.
pub fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                remainder.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
        if existing.as_os_str().is_empty() {
            break;
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for part in remainder.iter().rev() {
        resolved.push(part);
    }
    resolved
}
