//! YAML parsing with per-key source locations.
//!
//! serde_yaml performs the structural parse; a `SourceMap` built from a
//! line scan of the raw document maps key paths such as
//! `jobs.main.steps[2].run` to line/column so validation and compilation
//! errors can point into the user's file.

use crate::error::{io_error, SourceLocation, WorkflowError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    pub document: Value,
    pub source_map: SourceMap,
}

#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    file: Option<PathBuf>,
    entries: BTreeMap<String, (usize, usize)>,
}

impl SourceMap {
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Location of a key path, e.g. `jobs.main.steps[0].run`.
    pub fn locate(&self, path: &str) -> Option<SourceLocation> {
        self.entries
            .get(path)
            .map(|&(line, column)| SourceLocation::new(self.file.clone(), line, column))
    }

    /// Location of the deepest known ancestor of a key path.
    pub fn locate_nearest(&self, path: &str) -> Option<SourceLocation> {
        if let Some(location) = self.locate(path) {
            return Some(location);
        }
        let mut current = path;
        while let Some(cut) = current.rfind(['.', '[']) {
            current = &current[..cut];
            if let Some(location) = self.locate(current) {
                return Some(location);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, content: &str) -> Result<ParsedWorkflow, WorkflowError> {
        self.parse_with_file(content, None)
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedWorkflow, WorkflowError> {
        let content = fs::read_to_string(path).map_err(|err| io_error(path, err))?;
        self.parse_with_file(&content, Some(path.to_path_buf()))
    }

    fn parse_with_file(
        &self,
        content: &str,
        file: Option<PathBuf>,
    ) -> Result<ParsedWorkflow, WorkflowError> {
        let document: Value = serde_yaml::from_str(content).map_err(|source| {
            let location = source.location().map(|loc| {
                SourceLocation::new(file.clone(), loc.line(), loc.column())
            });
            WorkflowError::Yaml { location, source }
        })?;
        if !document.is_object() {
            return Err(WorkflowError::validation(
                "workflow document must be a mapping",
                file.clone().map(|f| SourceLocation::new(Some(f), 1, 1)),
            ));
        }
        let source_map = build_source_map(content, file);
        Ok(ParsedWorkflow {
            document,
            source_map,
        })
    }
}

#[derive(Debug)]
enum Frame {
    // A mapping key awaiting nested content, or a sequence item scope.
    Key { indent: usize, path: String },
    Item { indent: usize, path: String },
    Seq { indent: usize, path: String, next: usize },
}

impl Frame {
    fn indent(&self) -> usize {
        match self {
            Frame::Key { indent, .. } | Frame::Item { indent, .. } | Frame::Seq { indent, .. } => {
                *indent
            }
        }
    }

    fn path(&self) -> &str {
        match self {
            Frame::Key { path, .. } | Frame::Item { path, .. } | Frame::Seq { path, .. } => path,
        }
    }
}

/// Index key paths to (1-based line, 1-based column) by scanning block-style
/// YAML. Flow collections are treated as leaf values.
fn build_source_map(content: &str, file: Option<PathBuf>) -> SourceMap {
    let mut entries = BTreeMap::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut block_scalar_indent: Option<usize> = None;

    for (line_index, raw_line) in content.lines().enumerate() {
        let line_no = line_index + 1;
        let indent = raw_line.len() - raw_line.trim_start_matches(' ').len();
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(scalar_indent) = block_scalar_indent {
            if indent > scalar_indent {
                continue;
            }
            block_scalar_indent = None;
        }
        if trimmed.starts_with('#') || trimmed == "---" {
            continue;
        }

        if trimmed == "-" || trimmed.starts_with("- ") {
            scan_sequence_item(
                &mut entries,
                &mut stack,
                &mut block_scalar_indent,
                indent,
                trimmed,
                line_no,
            );
        } else {
            scan_mapping_key(
                &mut entries,
                &mut stack,
                &mut block_scalar_indent,
                indent,
                trimmed,
                line_no,
            );
        }
    }

    SourceMap { file, entries }
}

fn scan_sequence_item(
    entries: &mut BTreeMap<String, (usize, usize)>,
    stack: &mut Vec<Frame>,
    block_scalar_indent: &mut Option<usize>,
    indent: usize,
    trimmed: &str,
    line_no: usize,
) {
    while let Some(top) = stack.last() {
        let pop = match top {
            Frame::Item { indent: i, .. } => *i >= indent,
            Frame::Key { indent: i, .. } => *i > indent,
            Frame::Seq { indent: i, .. } => *i > indent,
        };
        if pop {
            stack.pop();
        } else {
            break;
        }
    }

    let item_path = match stack.last_mut() {
        Some(Frame::Seq {
            indent: seq_indent,
            path,
            next,
        }) if *seq_indent == indent => {
            let path = format!("{path}[{next}]");
            *next += 1;
            path
        }
        Some(frame) => {
            let container = frame.path().to_string();
            stack.push(Frame::Seq {
                indent,
                path: container.clone(),
                next: 1,
            });
            format!("{container}[0]")
        }
        None => return,
    };
    entries.insert(item_path.clone(), (line_no, indent + 1));

    let rest = trimmed[1..].trim_start();
    if rest.is_empty() {
        stack.push(Frame::Item {
            indent,
            path: item_path,
        });
        return;
    }
    let rest_indent = indent + (trimmed.len() - rest.len());
    stack.push(Frame::Item {
        indent,
        path: item_path,
    });
    scan_mapping_key(
        entries,
        stack,
        block_scalar_indent,
        rest_indent,
        rest,
        line_no,
    );
}

fn scan_mapping_key(
    entries: &mut BTreeMap<String, (usize, usize)>,
    stack: &mut Vec<Frame>,
    block_scalar_indent: &mut Option<usize>,
    indent: usize,
    trimmed: &str,
    line_no: usize,
) {
    let Some((key, value)) = split_key_value(trimmed) else {
        return;
    };

    while let Some(top) = stack.last() {
        if top.indent() >= indent {
            stack.pop();
        } else {
            break;
        }
    }

    let path = match stack.last() {
        Some(frame) => format!("{}.{key}", frame.path()),
        None => key.to_string(),
    };
    entries.insert(path.clone(), (line_no, indent + 1));

    if value.is_empty() {
        stack.push(Frame::Key { indent, path });
    } else if value.starts_with('|') || value.starts_with('>') {
        *block_scalar_indent = Some(indent);
    }
}

/// Split `key: value` at the first `:` that terminates the key. Returns
/// `None` for lines that are not mapping entries.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key_end, search_from) = if line.starts_with('"') || line.starts_with('\'') {
        let quote = line.chars().next().expect("non-empty line");
        let close = line[1..].find(quote)? + 1;
        (close + 1, close + 1)
    } else {
        (0, 0)
    };

    let colon = line[search_from..].char_indices().find_map(|(idx, ch)| {
        if ch != ':' {
            return None;
        }
        let absolute = search_from + idx;
        let next = line[absolute + 1..].chars().next();
        match next {
            None | Some(' ') | Some('\t') => Some(absolute),
            _ => None,
        }
    })?;

    let key = if key_end > 0 {
        line[1..key_end - 1].trim()
    } else {
        line[..colon].trim()
    };
    if key.is_empty() || key.contains(' ') && key_end == 0 {
        return None;
    }
    let value = line[colon + 1..].trim();
    // Strip trailing comments from scalar values.
    let value = match value.find(" #") {
        Some(cut) => value[..cut].trim_end(),
        None => value,
    };
    Some((key, value))
}
