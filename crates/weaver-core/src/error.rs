use thiserror::Error;

/// Errors raised while validating a step graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The listed steps could not be ordered. Every member of every cycle is
    /// reported, in definition order.
    #[error("Dependency cycle detected between steps: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
}

#[derive(Debug, Error)]
pub enum WeaverError {
    // Submission errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Unknown step type '{kind}' on step '{step}'")]
    UnknownStepType { step: String, kind: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid config for step '{step}': {message}")]
    InvalidConfig { step: String, message: String },

    // Execution errors
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step result for '{0}' was already recorded")]
    ResultAlreadyRecorded(String),

    #[error("Variable '{0}' was written by more than one parallel branch")]
    VariableConflict(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run exceeded timeout ({timeout_ms}ms)")]
    RunTimeout { timeout_ms: u64 },

    // Wait handle errors. Handle timeouts are a status, never an error.
    #[error("Wait handle not found: {0}")]
    HandleNotFound(String),

    #[error("Wait handle already exists: {0}")]
    HandleExists(String),

    // Provider errors
    #[error("No {0} provider configured")]
    NoProvider(&'static str),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("External call to {endpoint} failed: {message}")]
    ExternalCall { endpoint: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaverError {
    /// Wrap an arbitrary failure as a step error attributed to `step`.
    pub fn step(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.to_string(),
        }
    }

    /// Errors that are reported at submission, before any step runs.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::UnknownStepType { .. }
                | Self::InvalidDefinition(_)
                | Self::InvalidConfig { .. }
        )
    }

    /// The step an execution error originated from, if it names one.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } | Self::InvalidConfig { step, .. } => Some(step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_all_members() {
        let err = WeaverError::from(GraphError::Cycle {
            members: vec!["a".into(), "b".into(), "c".into()],
        });
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected between steps: a, b, c"
        );
        assert!(err.is_submission_error());
    }

    #[test]
    fn step_error_carries_origin() {
        let err = WeaverError::step("fetch", "connection refused");
        assert_eq!(err.failed_step(), Some("fetch"));
        assert!(!err.is_submission_error());
        assert_eq!(err.to_string(), "Step 'fetch' failed: connection refused");
    }
}
