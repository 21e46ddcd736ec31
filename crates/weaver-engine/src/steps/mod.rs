//! Step execution: one handler per [`StepKind`] variant.
//!
//! [`StepExecutor::run_step`] is the unit the orchestrator and the container
//! handlers share: it dispatches, records the step result exactly once,
//! and publishes lifecycle events. Container steps (`parallel`, `loop`,
//! `try_catch`) recurse back into it for the steps they own.

mod agent;
mod branch;
mod data;
mod external;
mod guard;
mod iterate;
mod parallel;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use weaver_core::config::EngineConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::{EngineEvent, EventBus};
use weaver_core::step::{Step, StepKind};
use weaver_core::traits::{AgentTeamProvider, ExternalCaller, SamplingProvider};
use weaver_core::types::{StepId, StepResult};

use crate::context::ExecutionContext;
use crate::graph::Plan;
use crate::handles::WaitHandleRegistry;

/// What a handler hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: Value,
    /// Jump chosen by a branching step.
    pub next_step: Option<StepId>,
    /// Set when the work was handed to a wait handle.
    pub handle_id: Option<String>,
}

impl StepOutcome {
    pub fn output(output: Value) -> Self {
        Self {
            output,
            next_step: None,
            handle_id: None,
        }
    }

    pub fn jump(output: Value, target: Option<StepId>) -> Self {
        Self {
            output,
            next_step: target,
            handle_id: None,
        }
    }
}

/// Per-run state shared by every step of the run, nested ones included.
pub struct RunScope {
    plan: Arc<Plan>,
    launched: Mutex<Vec<String>>,
}

impl RunScope {
    pub fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Wait handles created by this run, in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.launched
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn note_launch(&self, handle_id: &str) {
        if let Ok(mut ids) = self.launched.lock() {
            ids.push(handle_id.to_string());
        }
    }
}

/// Executes steps against an [`ExecutionContext`].
pub struct StepExecutor {
    sampler: Option<Arc<dyn SamplingProvider>>,
    team: Option<Arc<dyn AgentTeamProvider>>,
    caller: Option<Arc<dyn ExternalCaller>>,
    registry: Arc<WaitHandleRegistry>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<WaitHandleRegistry>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sampler: None,
            team: None,
            caller: None,
            registry,
            event_bus,
            config,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn SamplingProvider>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_team(mut self, team: Arc<dyn AgentTeamProvider>) -> Self {
        self.team = Some(team);
        self
    }

    pub fn with_caller(mut self, caller: Arc<dyn ExternalCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a step, record its result, and publish its events.
    ///
    /// Errors come back attributed to the step they originated in: a branch
    /// failing inside a parallel block keeps the branch's id.
    pub fn run_step<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
        scope: &'a RunScope,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let run_id = ctx.run_id().clone();
            let kind = step.step_type().as_str();
            debug!(step_id = %step.id, kind, "Step started");
            self.event_bus.publish(EngineEvent::StepStarted {
                run_id: run_id.clone(),
                step_id: step.id.clone(),
                kind,
            });

            let start = Instant::now();
            let result = self.execute(step, ctx, scope).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    let record = match &outcome.handle_id {
                        Some(handle_id) => {
                            self.event_bus.publish(EngineEvent::StepLaunched {
                                run_id,
                                step_id: step.id.clone(),
                                handle_id: handle_id.clone(),
                            });
                            StepResult::launched(
                                &step.id,
                                handle_id,
                                outcome.output.clone(),
                                elapsed_ms,
                            )
                        }
                        None => {
                            self.event_bus.publish(EngineEvent::StepCompleted {
                                run_id,
                                step_id: step.id.clone(),
                                duration_ms: elapsed_ms,
                            });
                            StepResult::completed(&step.id, outcome.output.clone(), elapsed_ms)
                        }
                    };
                    ctx.record_step_result(record)?;
                    debug!(step_id = %step.id, elapsed_ms, "Step complete");
                    Ok(outcome)
                }
                Err(WeaverError::Cancelled) => {
                    debug!(step_id = %step.id, "Step cancelled");
                    Err(WeaverError::Cancelled)
                }
                Err(e) => {
                    let e = attribute(&step.id, e);
                    error!(step_id = %step.id, error = %e, "Step failed");
                    self.event_bus.publish(EngineEvent::StepFailed {
                        run_id,
                        step_id: step.id.clone(),
                        error: e.to_string(),
                    });
                    let failed = StepResult::failed(&step.id, e.to_string(), elapsed_ms);
                    ctx.record_step_result(failed)?;
                    Err(e)
                }
            }
        })
    }

    /// Execute a step without recording a result. Cancellation of the
    /// context's token interrupts the handler.
    ///
    /// Containers are not interrupted from outside: their children observe
    /// the token, and the container unwinds once they have, keeping what
    /// already finished.
    pub fn execute<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
        scope: &'a RunScope,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let cancel = ctx.cancel_token().clone();
            if cancel.is_cancelled() {
                return Err(WeaverError::Cancelled);
            }

            let outcome = if step.kind.children().is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(WeaverError::Cancelled),
                    result = self.dispatch(step, ctx, scope) => result?,
                }
            } else {
                self.dispatch(step, ctx, scope).await?
            };

            if let Some(name) = &step.output_variable {
                ctx.set_variable(name.clone(), outcome.output.clone());
            }
            Ok(outcome)
        })
    }

    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        scope: &RunScope,
    ) -> Result<StepOutcome> {
        match &step.kind {
            StepKind::Agent(cfg) => {
                let work = agent::sample(self.sampler()?, agent::request(cfg, ctx, &self.config));
                self.perform(step, ctx, scope, work, cfg.timeout_ms).await
            }
            StepKind::AgentTeam(cfg) => {
                let request = agent::team_request(cfg, ctx, &self.config);
                let work = agent::collaborate(self.team()?, request);
                self.perform(step, ctx, scope, work, cfg.timeout_ms).await
            }
            StepKind::ExternalCall(cfg) => {
                let work = external::invoke(self.caller()?, external::request(cfg, ctx));
                self.perform(step, ctx, scope, work, cfg.timeout_ms).await
            }
            StepKind::Transform(cfg) => Ok(StepOutcome::output(data::transform(cfg, ctx))),
            StepKind::Condition(cfg) => Ok(branch::condition(step, cfg, ctx)),
            StepKind::Switch(cfg) => Ok(branch::switch(step, cfg, ctx)),
            StepKind::Parallel(cfg) => self.run_parallel(step, cfg, ctx, scope).await,
            StepKind::Loop(cfg) => self.run_loop(step, cfg, ctx, scope).await,
            StepKind::TryCatch(cfg) => self.run_try_catch(step, cfg, ctx, scope).await,
            StepKind::Merge(cfg) => Ok(StepOutcome::output(data::merge(cfg, ctx))),
            StepKind::SetVariable(cfg) => Ok(StepOutcome::output(data::set_variable(cfg, ctx))),
            StepKind::GetVariable(cfg) => {
                data::get_variable(step, cfg, ctx).map(StepOutcome::output)
            }
            StepKind::Delay(cfg) => {
                tokio::time::sleep(Duration::from_millis(cfg.ms)).await;
                Ok(StepOutcome::output(json!({ "delayed_ms": cfg.ms })))
            }
        }
    }

    /// Await provider work inline, or hand it to a wait handle when the step
    /// runs asynchronously.
    async fn perform(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        scope: &RunScope,
        work: BoxFuture<'static, Result<Value>>,
        timeout_ms: Option<u64>,
    ) -> Result<StepOutcome> {
        if !step.run_async {
            let output = match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
                    .await
                    .map_err(|_| {
                        WeaverError::step(&step.id, format!("timed out after {}ms", ms))
                    })??,
                None => work.await?,
            };
            return Ok(StepOutcome::output(output));
        }

        let metadata = HashMap::from([
            ("run_id".to_string(), json!(ctx.run_id().as_str())),
            ("workflow_id".to_string(), json!(ctx.workflow_id())),
            ("step_id".to_string(), json!(step.id)),
        ]);
        let handle = self
            .registry
            .register(
                step.step_type().as_str(),
                timeout_ms.map(Duration::from_millis),
                metadata,
            )
            .await?;
        let token = self.registry.token(&handle.id).await?;
        scope.note_launch(&handle.id);

        let registry = self.registry.clone();
        let handle_id = handle.id.clone();
        let step_id = step.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(
                        handle_id = %handle_id,
                        step_id = %step_id,
                        "Abandoning work for resolved handle"
                    );
                }
                result = work => {
                    let resolved = match result {
                        Ok(value) => registry.complete(&handle_id, value).await,
                        Err(e) => registry.fail(&handle_id, e.to_string()).await,
                    };
                    if let Err(e) = resolved {
                        warn!(handle_id = %handle_id, error = %e, "Could not resolve wait handle");
                    }
                }
            }
        });

        info!(step_id = %step.id, handle_id = %handle.id, "Step launched asynchronously");
        Ok(StepOutcome {
            output: json!({ "handle_id": handle.id, "status": "pending" }),
            next_step: None,
            handle_id: Some(handle.id),
        })
    }

    fn sampler(&self) -> Result<Arc<dyn SamplingProvider>> {
        self.sampler.clone().ok_or(WeaverError::NoProvider("sampling"))
    }

    fn team(&self) -> Result<Arc<dyn AgentTeamProvider>> {
        self.team.clone().ok_or(WeaverError::NoProvider("agent team"))
    }

    fn caller(&self) -> Result<Arc<dyn ExternalCaller>> {
        self.caller.clone().ok_or(WeaverError::NoProvider("external call"))
    }
}

/// Keep errors that already name their origin; attribute the rest to `step`.
fn attribute(step: &str, e: WeaverError) -> WeaverError {
    match e {
        e @ (WeaverError::StepFailed { .. }
        | WeaverError::InvalidConfig { .. }
        | WeaverError::Cancelled
        | WeaverError::RunTimeout { .. }) => e,
        other => WeaverError::step(step, other),
    }
}

/// The message of an error without its step prefix.
pub(crate) fn error_message(e: &WeaverError) -> String {
    match e {
        WeaverError::StepFailed { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
