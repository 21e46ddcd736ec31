use serde_json::{json, Value};
use tracing::warn;

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::{Step, TryCatchStep};

use crate::context::ExecutionContext;

use super::{error_message, RunScope, StepExecutor, StepOutcome};

impl StepExecutor {
    /// Run the wrapped step; on failure store `{ step, message }` in the
    /// error variable and run the catch step instead of failing.
    ///
    /// Cancellation and run timeouts are not caught.
    pub(super) async fn run_try_catch(
        &self,
        step: &Step,
        cfg: &TryCatchStep,
        ctx: &mut ExecutionContext,
        scope: &RunScope,
    ) -> Result<StepOutcome> {
        let wrapped = scope.plan().require(&cfg.try_step)?;

        let error = match self.run_step(wrapped, ctx, scope).await {
            Ok(outcome) => {
                return Ok(StepOutcome::output(json!({
                    "recovered": false,
                    "output": outcome.output,
                })))
            }
            Err(e @ (WeaverError::Cancelled | WeaverError::RunTimeout { .. })) => return Err(e),
            Err(e) => e,
        };

        warn!(step_id = %step.id, wrapped = %wrapped.id, error = %error, "Caught step failure");
        let origin = error.failed_step().unwrap_or(wrapped.id.as_str()).to_string();
        ctx.set_variable(
            cfg.error_variable.clone(),
            json!({ "step": origin, "message": error_message(&error) }),
        );

        let output = match &cfg.catch_step {
            Some(id) => {
                let handler = scope.plan().require(id)?;
                self.run_step(handler, ctx, scope).await?.output
            }
            None => Value::Null,
        };

        Ok(StepOutcome::output(json!({
            "recovered": true,
            "error": { "step": origin, "message": error_message(&error) },
            "output": output,
        })))
    }
}
