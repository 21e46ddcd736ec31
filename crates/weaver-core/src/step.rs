//! Workflow and step definitions.
//!
//! Definitions arrive on the wire with a string `type` tag and an untyped
//! `config` object. [`WorkflowDefinition::from_json`] converts them into the
//! closed [`StepKind`] enum so that unknown tags and malformed configs are
//! rejected before anything runs, and every consumer matches exhaustively.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;
use crate::error::{Result, WeaverError};
use crate::traits::Participant;
use crate::types::StepId;

/// The step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    Agent,
    AgentTeam,
    ExternalCall,
    Transform,
    Condition,
    Parallel,
    Loop,
    TryCatch,
    Switch,
    Merge,
    SetVariable,
    GetVariable,
    Delay,
}

impl StepType {
    pub const ALL: [StepType; 13] = [
        Self::Agent,
        Self::AgentTeam,
        Self::ExternalCall,
        Self::Transform,
        Self::Condition,
        Self::Parallel,
        Self::Loop,
        Self::TryCatch,
        Self::Switch,
        Self::Merge,
        Self::SetVariable,
        Self::GetVariable,
        Self::Delay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::AgentTeam => "agent_team",
            Self::ExternalCall => "external_call",
            Self::Transform => "transform",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Loop => "loop",
            Self::TryCatch => "try_catch",
            Self::Switch => "switch",
            Self::Merge => "merge",
            Self::SetVariable => "set_variable",
            Self::GetVariable => "get_variable",
            Self::Delay => "delay",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a parallel block does when a branch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failure cancels siblings and aborts the block.
    #[default]
    FailFast,
    /// Let every branch finish, then fail with all collected errors.
    CollectAll,
}

/// How variables written by parallel branches are folded back at join time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableMerge {
    /// Branches are merged in completion order; the last one to finish wins.
    #[default]
    LastWriterWins,
    /// Two branches writing the same variable is an error.
    Exclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Prompt template; `{{ path }}` placeholders are filled from the context.
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Overrides the engine's default sampling parameters.
    #[serde(default)]
    pub sampling: Option<SamplingConfig>,
    /// Deadline for the wait handle when the step runs asynchronously.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTeamStep {
    pub participants: Vec<Participant>,
    pub prompt: String,
    #[serde(default)]
    pub max_rounds: Option<usize>,
    #[serde(default)]
    pub sampling: Option<SamplingConfig>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCallStep {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Payload template; string leaves are rendered against the context.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Pure computation over the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformStep {
    /// Resolve a single context path.
    Path { path: String },
    /// Render a string template.
    Template { template: String },
    /// Build an object from field → path pairs.
    Object { fields: BTreeMap<String, String> },
    /// A constant.
    Literal { value: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    /// Branch step ids. Each runs concurrently on its own context snapshot.
    pub steps: Vec<StepId>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub variable_merge: Option<VariableMerge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    /// Context path of the array to iterate.
    pub over: String,
    /// Step invoked once per element.
    pub step: StepId,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryCatchStep {
    pub try_step: StepId,
    #[serde(default)]
    pub catch_step: Option<StepId>,
    /// Variable that receives `{ step, message }` when the wrapped step fails.
    #[serde(default = "default_error_variable")]
    pub error_variable: String,
}

fn default_error_variable() -> String {
    "error".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: serde_json::Value,
    pub target: StepId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStep {
    /// Context path of the discriminant.
    pub on: String,
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
    /// Fallthrough target; required.
    pub default: StepId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// `{ step_id: output, ... }`
    #[default]
    Object,
    /// `[output, ...]` in the listed order.
    Array,
    /// Shallow merge of object outputs, later steps overriding earlier ones.
    Deep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStep {
    pub steps: Vec<StepId>,
    #[serde(default)]
    pub mode: MergeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVariableStep {
    pub name: String,
    /// Value template; string leaves are rendered against the context.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Copy from a context path instead of using `value`.
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetVariableStep {
    pub name: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayStep {
    pub ms: u64,
}

/// Typed step payload, one variant per step type.
#[derive(Debug, Clone)]
pub enum StepKind {
    Agent(AgentStep),
    AgentTeam(AgentTeamStep),
    ExternalCall(ExternalCallStep),
    Transform(TransformStep),
    Condition(ConditionStep),
    Parallel(ParallelStep),
    Loop(LoopStep),
    TryCatch(TryCatchStep),
    Switch(SwitchStep),
    Merge(MergeStep),
    SetVariable(SetVariableStep),
    GetVariable(GetVariableStep),
    Delay(DelayStep),
}

impl StepKind {
    /// Build a typed payload from a wire tag and config object.
    pub fn from_wire(step: &str, tag: &str, config: serde_json::Value) -> Result<Self> {
        let step_type = StepType::parse(tag).ok_or_else(|| WeaverError::UnknownStepType {
            step: step.to_string(),
            kind: tag.to_string(),
        })?;

        let config = match config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        Ok(match step_type {
            StepType::Agent => Self::Agent(parse_config(step, config)?),
            StepType::AgentTeam => Self::AgentTeam(parse_config(step, config)?),
            StepType::ExternalCall => Self::ExternalCall(parse_config(step, config)?),
            StepType::Transform => Self::Transform(parse_config(step, config)?),
            StepType::Condition => Self::Condition(parse_config(step, config)?),
            StepType::Parallel => Self::Parallel(parse_config(step, config)?),
            StepType::Loop => Self::Loop(parse_config(step, config)?),
            StepType::TryCatch => Self::TryCatch(parse_config(step, config)?),
            StepType::Switch => Self::Switch(parse_config(step, config)?),
            StepType::Merge => Self::Merge(parse_config(step, config)?),
            StepType::SetVariable => Self::SetVariable(parse_config(step, config)?),
            StepType::GetVariable => Self::GetVariable(parse_config(step, config)?),
            StepType::Delay => Self::Delay(parse_config(step, config)?),
        })
    }

    /// Serialize the payload back into its wire config object.
    pub fn to_wire_config(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Agent(c) => serde_json::to_value(c),
            Self::AgentTeam(c) => serde_json::to_value(c),
            Self::ExternalCall(c) => serde_json::to_value(c),
            Self::Transform(c) => serde_json::to_value(c),
            Self::Condition(c) => serde_json::to_value(c),
            Self::Parallel(c) => serde_json::to_value(c),
            Self::Loop(c) => serde_json::to_value(c),
            Self::TryCatch(c) => serde_json::to_value(c),
            Self::Switch(c) => serde_json::to_value(c),
            Self::Merge(c) => serde_json::to_value(c),
            Self::SetVariable(c) => serde_json::to_value(c),
            Self::GetVariable(c) => serde_json::to_value(c),
            Self::Delay(c) => serde_json::to_value(c),
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Self::Agent(_) => StepType::Agent,
            Self::AgentTeam(_) => StepType::AgentTeam,
            Self::ExternalCall(_) => StepType::ExternalCall,
            Self::Transform(_) => StepType::Transform,
            Self::Condition(_) => StepType::Condition,
            Self::Parallel(_) => StepType::Parallel,
            Self::Loop(_) => StepType::Loop,
            Self::TryCatch(_) => StepType::TryCatch,
            Self::Switch(_) => StepType::Switch,
            Self::Merge(_) => StepType::Merge,
            Self::SetVariable(_) => StepType::SetVariable,
            Self::GetVariable(_) => StepType::GetVariable,
            Self::Delay(_) => StepType::Delay,
        }
    }

    /// Steps this step owns and dispatches itself.
    pub fn children(&self) -> Vec<&StepId> {
        match self {
            Self::Parallel(p) => p.steps.iter().collect(),
            Self::Loop(l) => vec![&l.step],
            Self::TryCatch(t) => std::iter::once(&t.try_step)
                .chain(t.catch_step.as_ref())
                .collect(),
            _ => vec![],
        }
    }

    /// Jump targets chosen by the step itself rather than `on_success`/`on_error`.
    pub fn branch_targets(&self) -> Vec<&StepId> {
        match self {
            Self::Switch(s) => s
                .cases
                .iter()
                .map(|c| &c.target)
                .chain(std::iter::once(&s.default))
                .collect(),
            _ => vec![],
        }
    }

    /// Whether this step decides the next step itself.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition(_) | Self::Switch(_))
    }

    /// Whether the step can hand its work to a wait handle.
    pub fn supports_async(&self) -> bool {
        matches!(
            self,
            Self::Agent(_) | Self::AgentTeam(_) | Self::ExternalCall(_)
        )
    }

    pub fn agent(prompt: impl Into<String>) -> Self {
        Self::Agent(AgentStep {
            prompt: prompt.into(),
            system: None,
            sampling: None,
            timeout_ms: None,
        })
    }

    pub fn external_call(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::ExternalCall(ExternalCallStep {
            endpoint: endpoint.into(),
            method: default_method(),
            payload,
            timeout_ms: None,
        })
    }

    pub fn literal(value: serde_json::Value) -> Self {
        Self::Transform(TransformStep::Literal { value })
    }

    pub fn condition(expression: impl Into<String>) -> Self {
        Self::Condition(ConditionStep {
            expression: expression.into(),
        })
    }

    pub fn parallel(steps: Vec<StepId>) -> Self {
        Self::Parallel(ParallelStep {
            steps,
            failure_policy: None,
            variable_merge: None,
        })
    }

    pub fn set_variable(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::SetVariable(SetVariableStep {
            name: name.into(),
            value,
            from: None,
        })
    }

    pub fn merge(steps: Vec<StepId>) -> Self {
        Self::Merge(MergeStep {
            steps,
            mode: MergeMode::Object,
        })
    }
}

fn parse_config<T: DeserializeOwned>(step: &str, config: serde_json::Value) -> Result<T> {
    serde_json::from_value(config).map_err(|e| WeaverError::InvalidConfig {
        step: step.to_string(),
        message: e.to_string(),
    })
}

/// A single step in a workflow.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub name: Option<String>,
    pub kind: StepKind,
    /// Explicit predecessors. `None` means "after the previous step".
    pub depends_on: Option<Vec<StepId>>,
    /// Jump target after success (condition: the `true` branch).
    pub on_success: Option<StepId>,
    /// Jump target after failure (condition: the `false` branch).
    pub on_error: Option<StepId>,
    /// Hand the work to a wait handle and return immediately.
    pub run_async: bool,
    /// Also write the step output into this shared variable.
    pub output_variable: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            depends_on: None,
            on_success: None,
            on_error: None,
            run_async: false,
            output_variable: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declare explicit dependencies. An empty list makes the step a root.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn on_success(mut self, target: impl Into<String>) -> Self {
        self.on_success = Some(target.into());
        self
    }

    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        self.on_error = Some(target.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.run_async = true;
        self
    }

    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    fn from_wire(raw: WireStep) -> Result<Self> {
        let kind = StepKind::from_wire(&raw.id, &raw.kind, raw.config)?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            kind,
            depends_on: raw.depends_on,
            on_success: raw.on_success,
            on_error: raw.on_error,
            run_async: raw.run_async,
            output_variable: raw.output_variable,
        })
    }

    fn to_wire(&self) -> serde_json::Result<WireStep> {
        Ok(WireStep {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.step_type().as_str().to_string(),
            config: self.kind.to_wire_config()?,
            depends_on: self.depends_on.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            run_async: self.run_async,
            output_variable: self.output_variable.clone(),
        })
    }
}

impl Serialize for Step {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireStep {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Option::is_none")]
    depends_on: Option<Vec<String>>,
    #[serde(default, alias = "onSuccess", skip_serializing_if = "Option::is_none")]
    on_success: Option<String>,
    #[serde(default, alias = "onError", skip_serializing_if = "Option::is_none")]
    on_error: Option<String>,
    #[serde(default, rename = "async")]
    run_async: bool,
    #[serde(default, alias = "outputVariable", skip_serializing_if = "Option::is_none")]
    output_variable: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireWorkflow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    steps: Vec<WireStep>,
    #[serde(default)]
    input: serde_json::Value,
}

/// An immutable workflow definition.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    /// Initial context seed, overlaid by the input passed at execution time.
    pub input: serde_json::Value,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps,
            input: serde_json::Value::Null,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Parse a definition from JSON, resolving step type tags.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let wire: WireWorkflow = serde_json::from_value(value)
            .map_err(|e| WeaverError::InvalidDefinition(e.to_string()))?;
        let steps = wire
            .steps
            .into_iter()
            .map(Step::from_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: wire.name.unwrap_or_else(|| wire.id.clone()),
            id: wire.id,
            steps,
            input: wire.input,
        })
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_definition() {
        let def = WorkflowDefinition::from_value(json!({
            "id": "wf",
            "steps": [
                { "id": "fetch", "type": "external_call",
                  "config": { "endpoint": "https://example.test/items" } },
                { "id": "check", "type": "condition", "dependsOn": ["fetch"],
                  "config": { "expression": "steps.fetch.count > 0" },
                  "onSuccess": "done", "onError": "empty" },
                { "id": "empty", "type": "set_variable",
                  "config": { "name": "empty", "value": true } },
                { "id": "done", "type": "delay", "config": { "ms": 5 } }
            ]
        }))
        .unwrap();

        assert_eq!(def.name, "wf");
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[1].depends_on.as_deref(), Some(&["fetch".to_string()][..]));
        assert_eq!(def.steps[1].on_success.as_deref(), Some("done"));
        match &def.steps[0].kind {
            StepKind::ExternalCall(c) => assert_eq!(c.method, "POST"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = WorkflowDefinition::from_value(json!({
            "id": "wf",
            "steps": [{ "id": "x", "type": "teleport" }]
        }))
        .unwrap_err();
        match err {
            WeaverError::UnknownStepType { step, kind } => {
                assert_eq!(step, "x");
                assert_eq!(kind, "teleport");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn switch_requires_default() {
        let err = WorkflowDefinition::from_value(json!({
            "id": "wf",
            "steps": [{ "id": "route", "type": "switch",
                        "config": { "on": "vars.kind", "cases": [] } }]
        }))
        .unwrap_err();
        assert!(matches!(err, WeaverError::InvalidConfig { ref step, .. } if step == "route"));
    }

    #[test]
    fn step_serializes_to_wire_form() {
        let step = Step::new("s", StepKind::set_variable("x", json!(1)))
            .depends_on(["a"])
            .asynchronous();
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "set_variable");
        assert_eq!(json["config"]["name"], "x");
        assert_eq!(json["depends_on"], json!(["a"]));
        assert_eq!(json["async"], true);
    }

    #[test]
    fn children_and_targets() {
        let t = StepKind::TryCatch(TryCatchStep {
            try_step: "risky".into(),
            catch_step: Some("recover".into()),
            error_variable: "error".into(),
        });
        assert_eq!(t.children(), vec!["risky", "recover"]);

        let s = StepKind::Switch(SwitchStep {
            on: "vars.mode".into(),
            cases: vec![SwitchCase { value: json!("fast"), target: "quick".into() }],
            default: "slow".into(),
        });
        assert_eq!(s.branch_targets(), vec!["quick", "slow"]);
        assert!(s.is_branching());
        assert!(!s.supports_async());
    }

    #[test]
    fn step_type_tags_roundtrip() {
        for t in StepType::ALL {
            assert_eq!(StepType::parse(t.as_str()), Some(t));
        }
        assert_eq!(StepType::parse("nope"), None);
    }
}
