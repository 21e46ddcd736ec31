use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tracing::{info, warn};

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::{FailurePolicy, ParallelStep, Step};

use crate::context::ExecutionContext;

use super::{error_message, RunScope, StepExecutor, StepOutcome};

impl StepExecutor {
    /// Fan out to every branch on its own context snapshot, then join.
    ///
    /// Branch contexts are merged back in completion order, including on
    /// failure or run cancellation so that partial results stay visible.
    /// Branches that were themselves cancelled are discarded.
    pub(super) async fn run_parallel(
        &self,
        step: &Step,
        cfg: &ParallelStep,
        ctx: &mut ExecutionContext,
        scope: &RunScope,
    ) -> Result<StepOutcome> {
        let policy = cfg
            .failure_policy
            .unwrap_or(self.config.parallel.failure_policy);
        let merge_policy = cfg
            .variable_merge
            .unwrap_or(self.config.parallel.variable_merge);
        let group = ctx.cancel_token().child_token();

        let mut pending = FuturesUnordered::new();
        for id in &cfg.steps {
            let child = scope.plan().require(id)?;
            let mut branch = ctx.fork(group.clone());
            pending.push(async move {
                let result = self.run_step(child, &mut branch, scope).await;
                (id, branch, result)
            });
        }
        info!(step_id = %step.id, branches = cfg.steps.len(), ?policy, "Parallel fan-out");

        let mut finished = Vec::with_capacity(cfg.steps.len());
        let mut outputs = Map::new();
        let mut errors: Vec<WeaverError> = Vec::new();

        while let Some((id, branch, result)) = pending.next().await {
            match result {
                Ok(outcome) => {
                    outputs.insert(id.clone(), outcome.output);
                    finished.push(branch);
                }
                // A sibling failed first and cancelled the group.
                Err(WeaverError::Cancelled) => {}
                Err(e) => {
                    warn!(step_id = %step.id, branch = %id, error = %e, "Parallel branch failed");
                    finished.push(branch);
                    errors.push(e);
                    if policy == FailurePolicy::FailFast {
                        group.cancel();
                    }
                }
            }
        }
        drop(pending);

        if ctx.cancel_token().is_cancelled() {
            if let Err(e) = ctx.merge_branches(finished, merge_policy) {
                warn!(step_id = %step.id, error = %e, "Could not keep finished branches");
            }
            return Err(WeaverError::Cancelled);
        }

        ctx.merge_branches(finished, merge_policy)?;

        match errors.len() {
            0 => Ok(StepOutcome::output(Value::Object(outputs))),
            1 => Err(errors.remove(0)),
            n => {
                let origin = errors[0]
                    .failed_step()
                    .unwrap_or(step.id.as_str())
                    .to_string();
                let detail = errors
                    .iter()
                    .map(|e| format!("{}: {}", e.failed_step().unwrap_or("?"), error_message(e)))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(WeaverError::step(origin, format!("{} branches failed: {}", n, detail)))
            }
        }
    }
}
