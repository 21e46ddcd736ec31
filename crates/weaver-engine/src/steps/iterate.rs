use serde_json::{json, Value};
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::{LoopStep, Step};

use crate::context::ExecutionContext;

use super::{error_message, RunScope, StepExecutor, StepOutcome};

impl StepExecutor {
    /// Run the body once per element, in order, collecting outputs.
    ///
    /// Each iteration sees the variables written by earlier ones. The body's
    /// own step result is not recorded per iteration; the loop's result holds
    /// the ordered outputs.
    pub(super) async fn run_loop(
        &self,
        step: &Step,
        cfg: &LoopStep,
        ctx: &mut ExecutionContext,
        scope: &RunScope,
    ) -> Result<StepOutcome> {
        let items = match ctx.resolve(&cfg.over) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(WeaverError::step(
                    &step.id,
                    format!("'{}' is not an array (found {})", cfg.over, type_name(&other)),
                ))
            }
            None => return Err(WeaverError::step(&step.id, format!("'{}' is not set", cfg.over))),
        };

        let limit = cfg
            .max_iterations
            .unwrap_or(self.config.engine.max_loop_iterations);
        if items.len() > limit {
            return Err(WeaverError::step(
                &step.id,
                format!("{} items exceed the iteration limit of {}", items.len(), limit),
            ));
        }

        let body = scope.plan().require(&cfg.step)?;
        let mut outputs = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let mut iteration = ctx.snapshot();
            iteration.set_variable(cfg.item_variable.clone(), item);
            iteration.set_variable(cfg.index_variable.clone(), json!(index));

            debug!(step_id = %step.id, body = %body.id, index, "Loop iteration");
            let outcome = self
                .execute(body, &mut iteration, scope)
                .await
                .map_err(|e| match e {
                    WeaverError::Cancelled => e,
                    other => WeaverError::step(
                        &body.id,
                        format!("iteration {}: {}", index, error_message(&other)),
                    ),
                })?;
            outputs.push(outcome.output);

            for (name, value) in iteration.written_variables() {
                if name != &cfg.item_variable && name != &cfg.index_variable {
                    ctx.set_variable(name.clone(), value.clone());
                }
            }
        }

        Ok(StepOutcome::output(Value::Array(outputs)))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
