use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use weaver_core::config::EngineConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::{EngineEvent, EventBus};
use weaver_core::step::{StepKind, WorkflowDefinition};
use weaver_core::traits::{AgentTeamProvider, ExternalCaller, SamplingProvider};
use weaver_core::types::{HandleStatus, RunId, RunStatus, StepId, StepResult, WorkflowResult};

use crate::context::ExecutionContext;
use crate::graph::Plan;
use crate::handles::WaitHandleRegistry;
use crate::retry::RetryingSampler;
use crate::steps::{RunScope, StepExecutor};
use crate::team::TurnTakingTeam;

/// Per-call overrides for [`Orchestrator::execute_workflow`]. Unset fields
/// fall back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub continue_on_error: Option<bool>,
    /// Wall-clock budget for the run (0 = unlimited).
    pub timeout_ms: Option<u64>,
    pub run_id: Option<RunId>,
    /// Cancelling this token halts the run.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Assembles an [`Orchestrator`] from its providers.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    sampler: Option<Arc<dyn SamplingProvider>>,
    team: Option<Arc<dyn AgentTeamProvider>>,
    caller: Option<Arc<dyn ExternalCaller>>,
    registry: Option<Arc<WaitHandleRegistry>>,
    event_bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sampler: None,
            team: None,
            caller: None,
            registry: None,
            event_bus: None,
        }
    }

    /// The sampler is wrapped in a [`RetryingSampler`].
    pub fn with_sampler(mut self, sampler: Arc<dyn SamplingProvider>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Without one, agent-team steps use a [`TurnTakingTeam`] over the sampler.
    pub fn with_team(mut self, team: Arc<dyn AgentTeamProvider>) -> Self {
        self.team = Some(team);
        self
    }

    pub fn with_caller(mut self, caller: Arc<dyn ExternalCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Share a registry between orchestrators.
    pub fn with_registry(mut self, registry: Arc<WaitHandleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Orchestrator {
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::default()));
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(WaitHandleRegistry::new(
                self.config.handles.clone(),
                event_bus.clone(),
            ))
        });

        let sampler = self
            .sampler
            .map(|s| Arc::new(RetryingSampler::new(s)) as Arc<dyn SamplingProvider>);
        let team = self.team.or_else(|| {
            sampler.clone().map(|s| {
                let team = TurnTakingTeam::new(s, self.config.team.clone());
                Arc::new(team) as Arc<dyn AgentTeamProvider>
            })
        });

        let mut executor =
            StepExecutor::new(registry.clone(), event_bus.clone(), self.config.clone());
        if let Some(sampler) = sampler {
            executor = executor.with_sampler(sampler);
        }
        if let Some(team) = team {
            executor = executor.with_team(team);
        }
        if let Some(caller) = self.caller {
            executor = executor.with_caller(caller);
        }

        Orchestrator {
            executor,
            registry,
            event_bus,
            config: self.config,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    scope: Arc<RunScope>,
    /// Still walking its plan. Once false, the run is only waiting on the
    /// handles it launched.
    walking: bool,
}

/// The run's wall-clock budget. `expire` cancels the walk when it runs out.
struct RunDeadline {
    at: tokio::time::Instant,
    timeout_ms: u64,
    expire: CancellationToken,
}

/// How the walk over the plan ended.
struct Halt {
    status: RunStatus,
    failed_step: Option<StepId>,
    error: Option<String>,
}

impl Halt {
    fn finished() -> Self {
        Self {
            status: RunStatus::Completed,
            failed_step: None,
            error: None,
        }
    }

    fn failed(step: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            failed_step: Some(step.into()),
            error: Some(error.into()),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            failed_step: None,
            error: Some(WeaverError::Cancelled.to_string()),
        }
    }
}

/// Top-level driver: validates a definition, walks its plan, and assembles
/// the [`WorkflowResult`].
pub struct Orchestrator {
    executor: StepExecutor,
    registry: Arc<WaitHandleRegistry>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    /// Runs in flight, plus finished runs that still own pending handles.
    runs: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn registry(&self) -> &Arc<WaitHandleRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check a definition without running it.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<Plan> {
        Plan::build(definition)
    }

    /// Run a workflow to completion, failure, cancellation, or launch.
    ///
    /// Submission errors (cycles, bad configs) come back as `Err` before any
    /// step runs. Everything that happens during execution is reported in
    /// the returned result.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<WorkflowResult> {
        let plan = Arc::new(Plan::build(definition)?);

        let run_id = options.run_id.unwrap_or_default();
        let cancel = options.cancel.unwrap_or_default();
        let continue_on_error = options
            .continue_on_error
            .unwrap_or(self.config.engine.continue_on_error);
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.config.engine.run_timeout_ms);

        let scope = Arc::new(RunScope::new(plan.clone()));
        self.track(&run_id, &cancel, &scope);

        // The walk's own token also fires on the run deadline, without
        // touching the caller's.
        let walk_token = cancel.child_token();
        let mut ctx = ExecutionContext::new(
            run_id.clone(),
            &definition.id,
            seed_input(&definition.input, input),
        )
        .with_cancel(walk_token.clone());

        let started_at = Utc::now();
        let start = Instant::now();
        info!(
            run_id = %run_id,
            workflow_id = %definition.id,
            steps = plan.order().len(),
            continue_on_error,
            timeout_ms,
            "Workflow run started"
        );
        self.event_bus.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            workflow_id: definition.id.clone(),
        });

        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms));
        let run_deadline = deadline.map(|at| RunDeadline {
            at,
            timeout_ms,
            expire: walk_token,
        });
        let halt = self
            .walk(&plan, &mut ctx, &scope, continue_on_error, run_deadline.as_ref())
            .await;

        let mut status = halt.status;
        let mut pending_handles = Vec::new();
        if status == RunStatus::Cancelled {
            cancel_handles(&self.registry, &scope.launched()).await;
        } else {
            for handle_id in scope.launched() {
                if let Ok(handle) = self.registry.get(&handle_id).await {
                    if handle.status == HandleStatus::Pending {
                        pending_handles.push(handle_id);
                    }
                }
            }
        }
        if status == RunStatus::Completed && !pending_handles.is_empty() {
            status = RunStatus::Launched;
        }
        if status == RunStatus::Launched {
            self.watch_launched(&run_id, cancel, scope);
        } else {
            self.untrack(&run_id);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        match status {
            RunStatus::Failed => error!(
                run_id = %run_id,
                failed_step = halt.failed_step.as_deref().unwrap_or("-"),
                error = halt.error.as_deref().unwrap_or("-"),
                duration_ms,
                "Workflow run failed"
            ),
            _ => info!(
                run_id = %run_id,
                status = ?status,
                pending = pending_handles.len(),
                duration_ms,
                "Workflow run finished"
            ),
        }
        self.event_bus.publish(EngineEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            duration_ms,
        });

        Ok(WorkflowResult {
            run_id,
            workflow_id: definition.id.clone(),
            status,
            step_results: ctx.step_results().clone(),
            execution_order: ctx.execution_order().to_vec(),
            variables: ctx.variables().clone(),
            duration_ms,
            failed_step: halt.failed_step,
            error: halt.error,
            pending_handles,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Cancel a run: halt it if still walking, and cancel every wait handle
    /// it launched. Returns false for unknown or already-finished runs.
    pub async fn cancel_run(&self, run_id: &RunId) -> bool {
        let active = match self.runs.lock() {
            Ok(mut runs) => runs.remove(run_id),
            Err(_) => None,
        };
        let Some(active) = active else {
            return false;
        };

        active.cancel.cancel();
        cancel_handles(&self.registry, &active.scope.launched()).await;
        info!(run_id = %run_id, "Workflow run cancelled");
        true
    }

    /// Ids of runs in flight or holding pending handles. Launched runs whose
    /// handles have all resolved are dropped here.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let runs: Vec<(RunId, Option<Arc<RunScope>>)> = match self.runs.lock() {
            Ok(runs) => runs
                .iter()
                .map(|(id, run)| (id.clone(), (!run.walking).then(|| run.scope.clone())))
                .collect(),
            Err(_) => return Vec::new(),
        };

        let mut active = Vec::with_capacity(runs.len());
        for (run_id, scope) in runs {
            let done = match &scope {
                Some(scope) => settled(&self.registry, scope).await,
                None => false,
            };
            if done {
                self.untrack(&run_id);
            } else {
                active.push(run_id);
            }
        }
        active
    }

    async fn walk(
        &self,
        plan: &Plan,
        ctx: &mut ExecutionContext,
        scope: &RunScope,
        continue_on_error: bool,
        deadline: Option<&RunDeadline>,
    ) -> Halt {
        let order = plan.order();
        let mut cursor = 0;

        while cursor < order.len() {
            let step_id = &order[cursor];
            let step = match plan.require(step_id) {
                Ok(step) => step,
                Err(e) => return Halt::failed(step_id, e.to_string()),
            };

            let step_start = Instant::now();
            let result = {
                let mut run = self.executor.run_step(step, ctx, scope);
                match deadline {
                    Some(deadline) => {
                        let finished = tokio::select! {
                            result = &mut run => Some(result),
                            _ = tokio::time::sleep_until(deadline.at) => None,
                        };
                        match finished {
                            Some(result) => result,
                            None => {
                                // Let the step unwind so containers keep what
                                // their children already recorded.
                                deadline.expire.cancel();
                                if let Err(e) = run.await {
                                    debug!(
                                        step_id = %step_id,
                                        error = %e,
                                        "Step unwound after run deadline"
                                    );
                                }
                                Err(WeaverError::RunTimeout {
                                    timeout_ms: deadline.timeout_ms,
                                })
                            }
                        }
                    }
                    None => run.await,
                }
            };

            let next = match result {
                Ok(outcome) => match outcome.next_step {
                    Some(target) => Some(target),
                    None if !step.kind.is_branching() => step.on_success.clone(),
                    None => None,
                },
                Err(WeaverError::Cancelled) => return Halt::cancelled(),
                Err(e @ WeaverError::RunTimeout { .. }) => {
                    // The in-flight step unwound as cancelled and recorded nothing.
                    let elapsed_ms = step_start.elapsed().as_millis() as u64;
                    let failed = StepResult::failed(step_id, e.to_string(), elapsed_ms);
                    if let Err(record) = ctx.record_step_result(failed) {
                        debug!(
                            step_id = %step_id,
                            error = %record,
                            "Timed-out step already recorded"
                        );
                    }
                    self.event_bus.publish(EngineEvent::StepFailed {
                        run_id: ctx.run_id().clone(),
                        step_id: step_id.clone(),
                        error: e.to_string(),
                    });
                    return Halt::failed(step_id, e.to_string());
                }
                Err(e) => {
                    let routed = step
                        .on_error
                        .clone()
                        .filter(|_| !matches!(step.kind, StepKind::Condition(_)));
                    if let Some(target) = routed {
                        warn!(
                            step_id = %step_id,
                            target = %target,
                            error = %e,
                            "Step failed, routing to error target"
                        );
                        Some(target)
                    } else if continue_on_error {
                        warn!(step_id = %step_id, error = %e, "Step failed, continuing");
                        None
                    } else {
                        let origin = e.failed_step().unwrap_or(step_id.as_str()).to_string();
                        return Halt::failed(origin, e.to_string());
                    }
                }
            };

            cursor = match self.advance(plan, ctx, cursor, next.as_deref()) {
                Ok(cursor) => cursor,
                Err(e) => return Halt::failed(step_id, e.to_string()),
            };
        }

        Halt::finished()
    }

    /// Move past the step at `cursor`, either to the next step or forward to
    /// `target`, recording everything jumped over as skipped.
    fn advance(
        &self,
        plan: &Plan,
        ctx: &mut ExecutionContext,
        cursor: usize,
        target: Option<&str>,
    ) -> Result<usize> {
        let Some(target) = target else {
            return Ok(cursor + 1);
        };
        let order = plan.order();
        let position = plan
            .position(target)
            .filter(|&p| p > cursor)
            .ok_or_else(|| {
                WeaverError::InvalidDefinition(format!(
                    "step '{}' cannot jump to '{}'",
                    order[cursor], target
                ))
            })?;

        for skipped in &order[cursor + 1..position] {
            if ctx.has_result(skipped) {
                continue;
            }
            ctx.record_step_result(StepResult::skipped(skipped))?;
            debug!(step_id = %skipped, "Step skipped");
            self.event_bus.publish(EngineEvent::StepSkipped {
                run_id: ctx.run_id().clone(),
                step_id: skipped.clone(),
            });
        }
        Ok(position)
    }

    fn track(&self, run_id: &RunId, cancel: &CancellationToken, scope: &Arc<RunScope>) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(
                run_id.clone(),
                ActiveRun {
                    cancel: cancel.clone(),
                    scope: scope.clone(),
                    walking: true,
                },
            );
        }
    }

    /// Keep a launched run tracked until its handles resolve. Cancelling the
    /// caller's token meanwhile cancels every handle the run launched.
    fn watch_launched(&self, run_id: &RunId, cancel: CancellationToken, scope: Arc<RunScope>) {
        if let Ok(mut runs) = self.runs.lock() {
            if let Some(run) = runs.get_mut(run_id) {
                run.walking = false;
            }
        }

        let run_id = run_id.clone();
        let registry = self.registry.clone();
        let runs = self.runs.clone();
        let mut events = self.event_bus.subscribe();
        let recheck = Duration::from_millis(self.config.handles.sweep_interval_ms.max(1));

        tokio::spawn(async move {
            loop {
                if settled(&registry, &scope).await {
                    debug!(run_id = %run_id, "Launched run settled");
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancel_handles(&registry, &scope.launched()).await;
                        info!(run_id = %run_id, "Launched run cancelled");
                        break;
                    }
                    event = events.recv() => {
                        if let Err(RecvError::Closed) = event {
                            break;
                        }
                    }
                    // Deadlines pass silently when no sweeper is running.
                    _ = tokio::time::sleep(recheck) => {}
                }
            }
            if let Ok(mut runs) = runs.lock() {
                runs.remove(&run_id);
            }
        });
    }

    fn untrack(&self, run_id: &RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }
}

/// Whether every handle the run launched has resolved or been collected.
async fn settled(registry: &WaitHandleRegistry, scope: &RunScope) -> bool {
    for handle_id in scope.launched() {
        if let Ok(handle) = registry.get(&handle_id).await {
            if !handle.status.is_terminal() {
                return false;
            }
        }
    }
    true
}

async fn cancel_handles(registry: &WaitHandleRegistry, handle_ids: &[String]) {
    for handle_id in handle_ids {
        if let Err(e) = registry.cancel(handle_id).await {
            debug!(handle_id = %handle_id, error = %e, "Handle gone before cancel");
        }
    }
}

/// Overlay the caller's input on the definition's seed. Objects merge
/// shallowly; any other caller input replaces the seed.
fn seed_input(defaults: &Value, input: Value) -> Value {
    match (defaults, input) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            merged.extend(overlay);
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, input) => input,
    }
}
