use std::io::Write;

use serde_json::Value;
use tempfile::NamedTempFile;

use weaver_core::step::{Step, StepKind, WorkflowDefinition};

/// A transform step that outputs `value`.
pub fn lit(id: &str, value: Value) -> Step {
    Step::new(id, StepKind::literal(value))
}

pub fn workflow(id: &str, steps: Vec<Step>) -> WorkflowDefinition {
    WorkflowDefinition::new(id, id, steps)
}

/// Write `contents` to a temporary `.toml` file. The file lives as long as
/// the returned handle.
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}
