use std::collections::{HashMap, HashSet};

use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::{Step, StepKind, WorkflowDefinition};
use weaver_core::types::StepId;

use super::scheduler::{GraphScheduler, Schedulable};

/// A validated, ordered workflow ready to run.
///
/// Steps named by a `parallel`, `loop` or `try_catch` step are *owned* by that
/// container: the main walk skips them and the container dispatches them. A
/// dependency on an owned step is treated as a dependency on its top-level
/// container, and a container inherits the outside dependencies of everything
/// it owns.
#[derive(Debug, Clone)]
pub struct Plan {
    workflow_id: String,
    steps: HashMap<StepId, Step>,
    order: Vec<StepId>,
    owner: HashMap<StepId, StepId>,
}

struct PlanNode {
    id: StepId,
    deps: Vec<StepId>,
}

impl Schedulable for PlanNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> Option<&[StepId]> {
        Some(&self.deps)
    }
}

impl Plan {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        // Full-graph check first: duplicates, unknown dependencies, cycles.
        GraphScheduler::order(&definition.steps)?;

        let steps: HashMap<StepId, Step> = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let mut owner: HashMap<StepId, StepId> = HashMap::new();
        for step in &definition.steps {
            for child in step.kind.children() {
                if child == &step.id {
                    return Err(invalid(format!("step '{}' cannot contain itself", step.id)));
                }
                if !steps.contains_key(child) {
                    return Err(invalid(format!(
                        "step '{}' references unknown step '{}'",
                        step.id, child
                    )));
                }
                if let Some(previous) = owner.insert(child.clone(), step.id.clone()) {
                    if previous != step.id {
                        return Err(invalid(format!(
                            "step '{}' is claimed by both '{}' and '{}'",
                            child, previous, step.id
                        )));
                    }
                }
            }
        }

        let plan = Self {
            workflow_id: definition.id.clone(),
            steps,
            order: Vec::new(),
            owner,
        };
        plan.validate(definition)?;

        let nodes: Vec<PlanNode> = definition
            .steps
            .iter()
            .filter(|s| !plan.is_owned(&s.id))
            .map(|s| plan.plan_node(definition, s))
            .collect::<Result<_>>()?;

        let order = GraphScheduler::order(&nodes)?;
        let plan = Self { order, ..plan };
        plan.check_jumps(definition)?;
        debug!(workflow_id = %definition.id, steps = plan.order.len(), "Execution plan built");

        Ok(plan)
    }

    /// Jumps only move forward through the final order.
    fn check_jumps(&self, definition: &WorkflowDefinition) -> Result<()> {
        for step in &definition.steps {
            let Some(from) = self.position(&step.id) else {
                continue;
            };
            let targets = step
                .on_success
                .iter()
                .chain(step.on_error.iter())
                .chain(step.kind.branch_targets());
            for target in targets {
                if self.position(target).map_or(true, |to| to <= from) {
                    return Err(invalid(format!(
                        "step '{}' jumps backward to '{}'",
                        step.id, target
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        for step in &definition.steps {
            // Ownership must not loop back onto itself.
            self.root_of(&step.id)?;

            if step.run_async && !step.kind.supports_async() {
                return Err(WeaverError::InvalidConfig {
                    step: step.id.clone(),
                    message: format!("step type '{}' cannot run asynchronously", step.step_type()),
                });
            }

            let jumps = step.on_success.iter().chain(step.on_error.iter());
            let declares_jumps = step.on_success.is_some()
                || step.on_error.is_some()
                || !step.kind.branch_targets().is_empty();
            if self.is_owned(&step.id) && declares_jumps {
                return Err(invalid(format!(
                    "step '{}' is nested in a container and cannot declare jump targets",
                    step.id
                )));
            }
            for target in jumps.chain(step.kind.branch_targets()) {
                if !self.steps.contains_key(target) {
                    return Err(invalid(format!(
                        "step '{}' jumps to unknown step '{}'",
                        step.id, target
                    )));
                }
                if self.is_owned(target) {
                    return Err(invalid(format!(
                        "step '{}' jumps to '{}', which is nested in a container",
                        step.id, target
                    )));
                }
            }

            if let StepKind::Merge(merge) = &step.kind {
                if let Some(missing) = merge.steps.iter().find(|s| !self.steps.contains_key(*s)) {
                    return Err(invalid(format!(
                        "merge step '{}' references unknown step '{}'",
                        step.id, missing
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the top-level scheduling node for `step`, folding in the outside
    /// dependencies of every step it (transitively) owns.
    fn plan_node(&self, definition: &WorkflowDefinition, step: &Step) -> Result<PlanNode> {
        let mut members = vec![step.id.as_str()];
        let mut cursor = 0;
        while cursor < members.len() {
            if let Some(s) = self.steps.get(members[cursor]) {
                members.extend(s.kind.children().into_iter().map(String::as_str));
            }
            cursor += 1;
        }

        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for member in members {
            for dep in raw_dependencies(definition, member) {
                let root = self.root_of(&dep)?;
                if root != step.id && seen.insert(root.clone()) {
                    deps.push(root);
                }
            }
        }

        Ok(PlanNode {
            id: step.id.clone(),
            deps,
        })
    }

    /// The top-level step that (transitively) owns `id`, or `id` itself.
    fn root_of(&self, id: &str) -> Result<StepId> {
        let mut current = id;
        for _ in 0..=self.steps.len() {
            match self.owner.get(current) {
                Some(parent) => current = parent,
                None => return Ok(current.to_string()),
            }
        }
        Err(invalid(format!("containment cycle through step '{}'", id)))
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Look up a step that the definition is known to contain.
    pub fn require(&self, id: &str) -> Result<&Step> {
        self.steps
            .get(id)
            .ok_or_else(|| invalid(format!("unknown step '{}'", id)))
    }

    /// Top-level steps in execution order.
    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|s| s == id)
    }

    pub fn is_owned(&self, id: &str) -> bool {
        self.owner.contains_key(id)
    }

    pub fn owner_of(&self, id: &str) -> Option<&str> {
        self.owner.get(id).map(String::as_str)
    }
}

/// Declared predecessors of a step, with the positional default applied.
fn raw_dependencies(definition: &WorkflowDefinition, id: &str) -> Vec<StepId> {
    let Some(pos) = definition.steps.iter().position(|s| s.id == id) else {
        return vec![];
    };
    match &definition.steps[pos].depends_on {
        Some(deps) => deps.clone(),
        None if pos > 0 => vec![definition.steps[pos - 1].id.clone()],
        None => vec![],
    }
}

fn invalid(message: String) -> WeaverError {
    WeaverError::InvalidDefinition(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaver_core::error::GraphError;
    use weaver_core::step::{LoopStep, TryCatchStep};

    fn lit(id: &str) -> Step {
        Step::new(id, StepKind::literal(json!(id)))
    }

    fn wf(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "test", steps)
    }

    #[test]
    fn test_parallel_children_leave_main_walk() {
        let def = wf(vec![
            lit("fetch").depends_on(Vec::<String>::new()),
            lit("transform").depends_on(["fetch"]),
            Step::new("fan", StepKind::parallel(vec!["branch_a".into(), "branch_b".into()]))
                .depends_on(["transform"]),
            lit("branch_a").depends_on(["transform"]),
            lit("branch_b").depends_on(["transform"]),
            Step::new("merge", StepKind::merge(vec!["branch_a".into(), "branch_b".into()]))
                .depends_on(["branch_a", "branch_b"]),
        ]);
        let plan = Plan::build(&def).unwrap();
        assert_eq!(plan.order(), &["fetch", "transform", "fan", "merge"]);
        assert!(plan.is_owned("branch_a"));
        assert_eq!(plan.owner_of("branch_b"), Some("fan"));
    }

    #[test]
    fn test_container_inherits_child_dependencies() {
        // `guard` is declared first but its child needs `prepare`.
        let def = wf(vec![
            Step::new(
                "guard",
                StepKind::TryCatch(TryCatchStep {
                    try_step: "risky".into(),
                    catch_step: None,
                    error_variable: "error".into(),
                }),
            )
            .depends_on(Vec::<String>::new()),
            lit("prepare").depends_on(Vec::<String>::new()),
            lit("risky").depends_on(["prepare"]),
        ]);
        let plan = Plan::build(&def).unwrap();
        assert_eq!(plan.order(), &["prepare", "guard"]);
    }

    #[test]
    fn test_remap_cycle_is_rejected() {
        // `audit` depends on a child of `fan`, while `fan` depends on `audit`.
        let def = wf(vec![
            Step::new("fan", StepKind::parallel(vec!["work".into()])).depends_on(["audit"]),
            lit("work").depends_on(Vec::<String>::new()),
            lit("audit").depends_on(["work"]),
        ]);
        match Plan::build(&def).unwrap_err() {
            WeaverError::Graph(GraphError::Cycle { members }) => {
                assert_eq!(members, vec!["fan", "audit"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_declared_cycle_rejected_before_anything_else() {
        let def = wf(vec![
            lit("a").depends_on(["c"]),
            lit("b").depends_on(["a"]),
            lit("c").depends_on(["b"]),
        ]);
        assert!(matches!(
            Plan::build(&def),
            Err(WeaverError::Graph(GraphError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_step_claimed_twice() {
        let def = wf(vec![
            Step::new("p1", StepKind::parallel(vec!["x".into()])),
            Step::new("p2", StepKind::parallel(vec!["x".into()])),
            lit("x"),
        ]);
        assert!(matches!(Plan::build(&def), Err(WeaverError::InvalidDefinition(_))));
    }

    #[test]
    fn test_unknown_jump_target() {
        let def = wf(vec![lit("a").on_success("nowhere")]);
        let err = Plan::build(&def).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_jump_into_container_rejected() {
        let def = wf(vec![
            lit("start").on_success("inner"),
            Step::new(
                "each",
                StepKind::Loop(LoopStep {
                    over: "input.items".into(),
                    step: "inner".into(),
                    item_variable: "item".into(),
                    index_variable: "index".into(),
                    max_iterations: None,
                }),
            ),
            lit("inner"),
        ]);
        assert!(matches!(Plan::build(&def), Err(WeaverError::InvalidDefinition(_))));
    }

    #[test]
    fn test_backward_jump_rejected() {
        let def = wf(vec![lit("a"), lit("b").on_success("a"), lit("c")]);
        let err = Plan::build(&def).unwrap_err();
        assert!(err.to_string().contains("jumps backward"), "{err}");

        let def = wf(vec![lit("a").on_error("c"), lit("b"), lit("c")]);
        assert!(Plan::build(&def).is_ok());
    }

    #[test]
    fn test_async_only_on_supported_kinds() {
        let def = wf(vec![lit("a").asynchronous()]);
        assert!(matches!(
            Plan::build(&def),
            Err(WeaverError::InvalidConfig { ref step, .. }) if step == "a"
        ));

        let def = wf(vec![Step::new("ask", StepKind::agent("hi")).asynchronous()]);
        assert!(Plan::build(&def).is_ok());
    }
}
