use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaverError};
use crate::step::{FailurePolicy, VariableMerge};

/// Top-level weaver configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: RunConfig,
    #[serde(default)]
    pub handles: HandleConfig,
    #[serde(default)]
    pub parallel: ParallelDefaults,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub team: TeamConfig,
}

/// Defaults for a single orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Record a failed step and keep going instead of aborting (default: false).
    #[serde(default)]
    pub continue_on_error: bool,
    /// Wall-clock budget for one run in milliseconds (0 = unlimited).
    #[serde(default = "default_run_timeout")]
    pub run_timeout_ms: u64,
    /// Upper bound on loop iterations per loop step.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            run_timeout_ms: default_run_timeout(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

fn default_run_timeout() -> u64 { 300_000 }
fn default_max_loop_iterations() -> usize { 1_000 }

/// Wait handle registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Deadline applied to handles created without an explicit timeout (0 = none).
    #[serde(default = "default_handle_timeout")]
    pub default_timeout_ms: u64,
    /// How often the background sweeper runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// How long terminal handles are kept before the sweeper purges them.
    #[serde(default = "default_retention")]
    pub retention_ms: u64,
    /// Poll interval used by multi-wait and by callers that do not pass one.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_handle_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            retention_ms: default_retention(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_handle_timeout() -> u64 { 300_000 }
fn default_sweep_interval() -> u64 { 1_000 }
fn default_retention() -> u64 { 600_000 }
fn default_poll_interval() -> u64 { 100 }

/// Policies applied to parallel steps that do not set their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelDefaults {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub variable_merge: VariableMerge,
}

/// Sampling parameters. Used as the engine default and as a per-step override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry: None,
        }
    }
}

fn default_temperature() -> f32 { 0.0 }
fn default_max_tokens() -> u32 { 4096 }

/// Retry configuration for sampling requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Agent-team defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// A contribution containing this marker ends the session early.
    #[serde(default = "default_consensus_marker")]
    pub consensus_marker: String,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            consensus_marker: default_consensus_marker(),
        }
    }
}

fn default_max_rounds() -> usize { 3 }
fn default_consensus_marker() -> String { "[CONSENSUS]".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaverError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeaverError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
