use serde_json::json;
use tracing::debug;

use weaver_core::step::{ConditionStep, Step, SwitchStep};

use crate::context::ExecutionContext;
use crate::expr;

use super::StepOutcome;

/// True jumps to `on_success`, false to `on_error`; a missing target means
/// fall through to the next step.
pub(super) fn condition(step: &Step, cfg: &ConditionStep, ctx: &ExecutionContext) -> StepOutcome {
    let result = ctx.evaluate(&cfg.expression);
    let target = if result {
        step.on_success.clone()
    } else {
        step.on_error.clone()
    };
    debug!(
        step_id = %step.id,
        expression = %cfg.expression,
        result,
        target = ?target,
        "Condition evaluated"
    );
    StepOutcome::jump(json!({ "result": result, "target": target }), target)
}

/// Jump to the first case equal to the discriminant, else to `default`.
pub(super) fn switch(step: &Step, cfg: &SwitchStep, ctx: &ExecutionContext) -> StepOutcome {
    let value = ctx.resolve(&cfg.on).unwrap_or(serde_json::Value::Null);
    let target = cfg
        .cases
        .iter()
        .find(|case| expr::matches(&case.value, &value))
        .map(|case| case.target.clone())
        .unwrap_or_else(|| cfg.default.clone());
    debug!(step_id = %step.id, on = %cfg.on, target = %target, "Switch selected target");
    StepOutcome::jump(json!({ "value": value, "target": target }), Some(target))
}
