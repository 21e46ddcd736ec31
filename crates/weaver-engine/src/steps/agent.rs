use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use weaver_core::config::EngineConfig;
use weaver_core::error::Result;
use weaver_core::step::{AgentStep, AgentTeamStep};
use weaver_core::traits::{AgentTeamProvider, SamplingProvider, SamplingRequest, TeamRequest};

use crate::context::ExecutionContext;

/// Build a sampling request with the prompt rendered against the context.
pub(super) fn request(
    cfg: &AgentStep,
    ctx: &ExecutionContext,
    config: &EngineConfig,
) -> SamplingRequest {
    let sampling = cfg.sampling.clone().unwrap_or_else(|| config.sampling.clone());
    let mut request = SamplingRequest::new(ctx.render(&cfg.prompt), sampling);
    if let Some(system) = &cfg.system {
        request = request.with_system(ctx.render(system));
    }
    request
}

pub(super) fn team_request(
    cfg: &AgentTeamStep,
    ctx: &ExecutionContext,
    config: &EngineConfig,
) -> TeamRequest {
    TeamRequest {
        participants: cfg.participants.clone(),
        prompt: ctx.render(&cfg.prompt),
        max_rounds: cfg.max_rounds.unwrap_or(config.team.max_rounds),
        config: cfg.sampling.clone().unwrap_or_else(|| config.sampling.clone()),
    }
}

/// Output: the provider response as `{ text, model, usage }`.
pub(super) fn sample(
    sampler: Arc<dyn SamplingProvider>,
    request: SamplingRequest,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let response = sampler.sample(request).await?;
        Ok(serde_json::to_value(response)?)
    })
}

/// Output: the transcript as `{ contributions, rounds, consensus }`.
pub(super) fn collaborate(
    team: Arc<dyn AgentTeamProvider>,
    request: TeamRequest,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let transcript = team.run_rounds(request).await?;
        Ok(serde_json::to_value(transcript)?)
    })
}
