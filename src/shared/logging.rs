use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Best-effort append of one JSON line; logging must never fail the run.
pub fn append_jsonl_line(path: &Path, payload: &Value) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let Ok(line) = serde_json::to_string(payload) else {
        return;
    };
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
}
