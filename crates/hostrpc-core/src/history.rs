//! Append-only log of shipped callables and their calls.
//!
//! The file replays offline: it starts with a loader bootstrap line, then
//! holds one block per call (a blank line, the shipped source, and a literal
//! call with JSON-encoded arguments).

use crate::error::{Result, RpcError};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// First line of every history file.
pub const BOOTSTRAP_LINE: &str = "const __rpc_import = (path) => require(path);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHistory {
    path: PathBuf,
}

impl ExecutionHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one call block.
    pub fn record(&self, source_lines: &[String], name: &str, args: &[Value]) -> Result<()> {
        let is_empty = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let mut block = String::new();
        if is_empty {
            block.push_str(BOOTSTRAP_LINE);
            block.push('\n');
        }
        block.push('\n');
        for line in source_lines {
            block.push_str(line);
            block.push('\n');
        }
        let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
        block.push_str(&format!("{}({});\n", name, rendered.join(", ")));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RpcError::io_with_path(e, &self.path))?;
        file.write_all(block.as_bytes())
            .map_err(|e| RpcError::io_with_path(e, &self.path))?;

        debug!("Recorded call to {} in {}", name, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_written_once() {
        let temp = TempDir::new().unwrap();
        let history = ExecutionHistory::new(temp.path().join("history.js"));
        let source = vec!["function add(a, b) {".to_string(), "    return a + b;".to_string(), "}".to_string()];

        history.record(&source, "add", &[json!(2), json!(3)]).unwrap();
        history.record(&source, "add", &[json!("x"), json!(null)]).unwrap();

        let text = std::fs::read_to_string(history.path()).unwrap();
        assert_eq!(text.matches(BOOTSTRAP_LINE).count(), 1);
        assert!(text.starts_with(BOOTSTRAP_LINE));
        assert!(text.contains("\n\nfunction add(a, b) {\n    return a + b;\n}\nadd(2, 3);\n"));
        assert!(text.ends_with("add(\"x\", null);\n"));
    }

    #[test]
    fn test_existing_content_is_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.js");
        std::fs::write(&path, "// earlier session\n").unwrap();

        ExecutionHistory::new(&path)
            .record(&["function f() {}".to_string()], "f", &[])
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("// earlier session\n\nfunction f() {}\nf();\n"));
        assert!(!text.contains(BOOTSTRAP_LINE));
    }
}
