use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;
use crate::error::Result;

/// A single prompt submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub config: SamplingConfig,
}

impl SamplingRequest {
    pub fn new(prompt: impl Into<String>, config: SamplingConfig) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            config,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingResponse {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl SamplingResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            usage: None,
        }
    }
}

/// Sampling provider: submit a prompt, receive a response.
///
/// Caching and retries are the provider's concern. The asynchronous variant
/// (returning a wait handle id) is layered on top by the engine.
pub trait SamplingProvider: Send + Sync + 'static {
    fn sample(&self, request: SamplingRequest) -> BoxFuture<'_, Result<SamplingResponse>>;
}

/// One member of an agent team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub system: Option<String>,
}

fn default_role() -> String {
    "participant".to_string()
}

impl Participant {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            system: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRequest {
    pub participants: Vec<Participant>,
    pub prompt: String,
    pub max_rounds: usize,
    #[serde(default)]
    pub config: SamplingConfig,
}

/// A single turn in a team transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    pub round: usize,
    pub participant_id: String,
    pub role: String,
    pub contribution: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub contributions: Vec<Contribution>,
    /// Rounds started, including a round cut short by consensus.
    pub rounds: usize,
    pub consensus: bool,
}

/// Agent-team provider: turn-taking contribution accumulation.
pub trait AgentTeamProvider: Send + Sync + 'static {
    fn run_rounds(&self, request: TeamRequest) -> BoxFuture<'_, Result<Transcript>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// External call: an opaque, possibly-failing operation. The engine never
/// retries it.
pub trait ExternalCaller: Send + Sync + 'static {
    fn invoke(&self, request: ExternalRequest) -> BoxFuture<'_, Result<serde_json::Value>>;
}
