use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a step, unique within its workflow.
pub type StepId = String;

/// Unique identifier of one orchestrator run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Jumped over by a control-flow step.
    Skipped,
    /// Work was handed to a wait handle and is still outstanding.
    Launched,
}

/// The recorded result of one step. Written once per step id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn completed(
        step_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            handle_id: None,
            duration_ms,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            handle_id: None,
            duration_ms,
        }
    }

    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            handle_id: None,
            duration_ms: 0,
        }
    }

    pub fn launched(
        step_id: impl Into<String>,
        handle_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Launched,
            output: Some(output),
            error: None,
            handle_id: Some(handle_id.into()),
            duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Launched)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Every step was dispatched but at least one wait handle is outstanding.
    Launched,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// What a run hands back to its caller. A failed run is still a well-formed
/// result carrying the partial step results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub step_results: HashMap<StepId, StepResult>,
    /// Step ids in the order their results were recorded.
    pub execution_order: Vec<StepId>,
    pub variables: HashMap<String, serde_json::Value>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_handles: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn output_of(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.step_results.get(step_id).and_then(|r| r.output.as_ref())
    }
}

/// Lifecycle of a wait handle. Monotonic: once non-pending it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl HandleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of an outstanding (or finished) asynchronous operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitHandle {
    pub id: String,
    /// Kind of the underlying operation, e.g. `agent` or `external_call`.
    #[serde(rename = "type")]
    pub kind: String,
    pub status: HandleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Resolution policy for waiting on several handles at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Every handle terminal; success iff every one completed.
    All,
    /// First handle to complete successfully.
    Any,
    /// First handle to reach any terminal state.
    Race,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_status_terminality() {
        assert!(!HandleStatus::Pending.is_terminal());
        for s in [
            HandleStatus::Completed,
            HandleStatus::Failed,
            HandleStatus::Timeout,
            HandleStatus::Cancelled,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn step_result_constructors() {
        let ok = StepResult::completed("a", serde_json::json!(1), 5);
        assert!(ok.succeeded());
        let failed = StepResult::failed("b", "boom", 2);
        assert!(!failed.succeeded());
        assert_eq!(failed.error.as_deref(), Some("boom"));
        let launched = StepResult::launched("c", "h-1", serde_json::json!({}), 0);
        assert!(launched.succeeded());
        assert_eq!(launched.handle_id.as_deref(), Some("h-1"));
    }

    #[test]
    fn wait_handle_serializes_kind_as_type() {
        let handle = WaitHandle {
            id: "h".into(),
            kind: "agent".into(),
            status: HandleStatus::Pending,
            created_at: Utc::now(),
            timeout_at: None,
            resolved_at: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["status"], "pending");
    }
}
