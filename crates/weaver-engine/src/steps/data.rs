use serde_json::{Map, Value};

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::{
    GetVariableStep, MergeMode, MergeStep, SetVariableStep, Step, TransformStep,
};

use crate::context::ExecutionContext;

pub(super) fn transform(cfg: &TransformStep, ctx: &ExecutionContext) -> Value {
    match cfg {
        TransformStep::Path { path } => ctx.resolve(path).unwrap_or(Value::Null),
        TransformStep::Template { template } => Value::String(ctx.render(template)),
        TransformStep::Object { fields } => Value::Object(
            fields
                .iter()
                .map(|(field, path)| (field.clone(), ctx.resolve(path).unwrap_or(Value::Null)))
                .collect(),
        ),
        TransformStep::Literal { value } => value.clone(),
    }
}

/// Combine the outputs of earlier steps. Steps without a result contribute
/// `null` (object, array) or nothing (deep).
pub(super) fn merge(cfg: &MergeStep, ctx: &ExecutionContext) -> Value {
    let output = |id: &str| ctx.step_output(id).cloned().unwrap_or(Value::Null);
    match cfg.mode {
        MergeMode::Object => Value::Object(
            cfg.steps
                .iter()
                .map(|id| (id.clone(), output(id)))
                .collect(),
        ),
        MergeMode::Array => Value::Array(cfg.steps.iter().map(|id| output(id)).collect()),
        MergeMode::Deep => {
            let mut merged = Map::new();
            for id in &cfg.steps {
                if let Some(Value::Object(fields)) = ctx.step_output(id) {
                    for (k, v) in fields {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(merged)
        }
    }
}

pub(super) fn set_variable(cfg: &SetVariableStep, ctx: &mut ExecutionContext) -> Value {
    let value = match &cfg.from {
        Some(path) => ctx.resolve(path).unwrap_or(Value::Null),
        None => ctx.render_value(&cfg.value),
    };
    ctx.set_variable(cfg.name.clone(), value.clone());
    value
}

pub(super) fn get_variable(
    step: &Step,
    cfg: &GetVariableStep,
    ctx: &ExecutionContext,
) -> Result<Value> {
    ctx.get_variable(&cfg.name)
        .cloned()
        .or_else(|| cfg.default.clone())
        .ok_or_else(|| WeaverError::step(&step.id, format!("variable '{}' is not set", cfg.name)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use weaver_core::step::StepKind;
    use weaver_core::types::{RunId, StepResult};

    use super::*;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(RunId::new(), "wf", json!({ "name": "ada" }));
        ctx.record_step_result(StepResult::completed("a", json!({ "x": 1, "y": 1 }), 0)).unwrap();
        ctx.record_step_result(StepResult::completed("b", json!({ "y": 2 }), 0)).unwrap();
        ctx.record_step_result(StepResult::completed("c", json!("plain"), 0)).unwrap();
        ctx
    }

    #[test]
    fn transform_ops() {
        let c = ctx();
        assert_eq!(transform(&TransformStep::Path { path: "steps.a.x".into() }, &c), json!(1));
        assert_eq!(
            transform(&TransformStep::Template { template: "hello {{input.name}}".into() }, &c),
            json!("hello ada")
        );
        let fields = BTreeMap::from([
            ("who".to_string(), "input.name".to_string()),
            ("y".to_string(), "steps.b.y".to_string()),
        ]);
        assert_eq!(
            transform(&TransformStep::Object { fields }, &c),
            json!({ "who": "ada", "y": 2 })
        );
    }

    #[test]
    fn merge_modes() {
        let c = ctx();
        let mut cfg = MergeStep {
            steps: vec!["a".into(), "b".into(), "c".into(), "missing".into()],
            mode: MergeMode::Object,
        };
        assert_eq!(
            merge(&cfg, &c),
            json!({ "a": { "x": 1, "y": 1 }, "b": { "y": 2 }, "c": "plain", "missing": null })
        );

        cfg.mode = MergeMode::Array;
        assert_eq!(merge(&cfg, &c), json!([{ "x": 1, "y": 1 }, { "y": 2 }, "plain", null]));

        cfg.mode = MergeMode::Deep;
        assert_eq!(merge(&cfg, &c), json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn set_and_get_variable() {
        let mut c = ctx();
        let cfg = SetVariableStep {
            name: "greeting".into(),
            value: json!({ "text": "hi {{input.name}}", "x": "{{steps.a.x}}" }),
            from: None,
        };
        assert_eq!(set_variable(&cfg, &mut c), json!({ "text": "hi ada", "x": 1 }));

        let step = Step::new("get", StepKind::set_variable("unused", json!(null)));
        let get = GetVariableStep { name: "greeting".into(), default: None };
        assert_eq!(get_variable(&step, &get, &c).unwrap()["x"], json!(1));

        let missing = GetVariableStep { name: "nope".into(), default: None };
        assert!(get_variable(&step, &missing, &c).is_err());

        let defaulted = GetVariableStep { name: "nope".into(), default: Some(json!(0)) };
        assert_eq!(get_variable(&step, &defaulted, &c).unwrap(), json!(0));
    }
}
