use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weaver_core::error::{Result, WeaverError};
use weaver_core::step::VariableMerge;
use weaver_core::types::{RunId, StepId, StepResult};

use crate::expr;

/// Per-run mutable state: input, shared variables and recorded step results.
///
/// Step results are write-once. Parallel branches each work on a
/// [`snapshot`](Self::snapshot) and are folded back with
/// [`merge_branches`](Self::merge_branches) at join time.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    workflow_id: String,
    input: Value,
    variables: HashMap<String, Value>,
    step_results: HashMap<StepId, StepResult>,
    order: Vec<StepId>,
    /// Results recorded before this context was forked.
    fork_point: usize,
    /// Variables written since this context was created or forked.
    written: HashSet<String>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            input,
            variables: HashMap::new(),
            step_results: HashMap::new(),
            order: Vec::new(),
            fork_point: 0,
            written: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Fires when the run (or the enclosing parallel group) is cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.written.insert(name.clone());
        self.variables.insert(name, value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Variables written since this context was created or forked.
    pub fn written_variables(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.written
            .iter()
            .filter_map(|name| self.variables.get_key_value(name))
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn record_step_result(&mut self, result: StepResult) -> Result<()> {
        if self.step_results.contains_key(&result.step_id) {
            return Err(WeaverError::ResultAlreadyRecorded(result.step_id));
        }
        self.order.push(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
        Ok(())
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id).and_then(|r| r.output.as_ref())
    }

    pub fn has_result(&self, step_id: &str) -> bool {
        self.step_results.contains_key(step_id)
    }

    pub fn step_results(&self) -> &HashMap<StepId, StepResult> {
        &self.step_results
    }

    /// Step ids in the order their results were recorded.
    pub fn execution_order(&self) -> &[StepId] {
        &self.order
    }

    /// An isolated copy for a concurrent branch. It sees everything recorded
    /// so far; only what it adds afterwards is merged back.
    pub fn snapshot(&self) -> Self {
        Self {
            fork_point: self.order.len(),
            written: HashSet::new(),
            ..self.clone()
        }
    }

    /// Like [`snapshot`](Self::snapshot), bound to a different cancellation token.
    pub fn fork(&self, cancel: CancellationToken) -> Self {
        self.snapshot().with_cancel(cancel)
    }

    /// Fold one branch back in: its new step results and every variable it
    /// wrote, overwriting current values.
    pub fn merge(&mut self, branch: ExecutionContext) -> Result<()> {
        let ExecutionContext {
            mut step_results,
            order,
            fork_point,
            variables,
            written,
            ..
        } = branch;

        for id in order.into_iter().skip(fork_point) {
            if let Some(result) = step_results.remove(&id) {
                self.record_step_result(result)?;
            }
        }
        for name in written {
            if let Some(value) = variables.get(&name) {
                self.set_variable(name, value.clone());
            }
        }
        Ok(())
    }

    /// Merge branches given in completion order under `policy`.
    ///
    /// `LastWriterWins`: a variable written by several branches takes the
    /// value of the branch that finished last. `Exclusive`: such a variable
    /// is a [`WeaverError::VariableConflict`] and nothing is merged.
    pub fn merge_branches(
        &mut self,
        branches: Vec<ExecutionContext>,
        policy: VariableMerge,
    ) -> Result<()> {
        if policy == VariableMerge::Exclusive {
            let mut seen = HashSet::new();
            for branch in &branches {
                let mut names: Vec<&String> = branch.written.iter().collect();
                names.sort();
                if let Some(name) = names.into_iter().find(|n| !seen.insert(n.as_str())) {
                    return Err(WeaverError::VariableConflict(name.clone()));
                }
            }
        }

        for branch in branches {
            self.merge(branch)?;
        }
        Ok(())
    }

    /// Resolve a context path: `input.*`, `vars.*`, `steps.<id>.*`, or a
    /// bare variable name.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };

        match root {
            "input" => expr::lookup(&self.input, rest).cloned(),
            "vars" => {
                let rest = rest?;
                let (name, tail) = split_head(rest);
                expr::lookup(self.variables.get(name)?, tail).cloned()
            }
            "steps" => {
                let rest = rest?;
                let (id, tail) = split_head(rest);
                expr::lookup(self.step_output(id)?, tail).cloned()
            }
            name => expr::lookup(self.variables.get(name)?, rest).cloned(),
        }
    }

    /// Fill `{{ path }}` placeholders.
    pub fn render(&self, template: &str) -> String {
        expr::render(template, |path| self.resolve(path))
    }

    /// Render every string leaf of a JSON template.
    pub fn render_value(&self, template: &Value) -> Value {
        expr::render_value(template, &|path| self.resolve(path))
    }

    pub fn evaluate(&self, expression: &str) -> bool {
        expr::evaluate(expression, |path| self.resolve(path))
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            RunId::from_string("run"),
            "wf",
            json!({ "user": { "name": "ada" }, "items": [1, 2, 3] }),
        )
    }

    #[test]
    fn step_results_are_write_once() {
        let mut c = ctx();
        c.record_step_result(StepResult::completed("a", json!(1), 0)).unwrap();
        let err = c
            .record_step_result(StepResult::completed("a", json!(2), 0))
            .unwrap_err();
        assert!(matches!(err, WeaverError::ResultAlreadyRecorded(ref id) if id == "a"));
        assert_eq!(c.step_output("a"), Some(&json!(1)));
    }

    #[test]
    fn resolves_all_roots() {
        let mut c = ctx();
        c.set_variable("count", json!(3));
        c.set_variable("cfg", json!({ "mode": "fast" }));
        c.record_step_result(StepResult::completed("fetch", json!({ "rows": [{ "id": 7 }] }), 0))
            .unwrap();

        assert_eq!(c.resolve("input.user.name"), Some(json!("ada")));
        assert_eq!(c.resolve("input.items.1"), Some(json!(2)));
        assert_eq!(c.resolve("vars.cfg.mode"), Some(json!("fast")));
        assert_eq!(c.resolve("count"), Some(json!(3)));
        assert_eq!(c.resolve("steps.fetch.rows.0.id"), Some(json!(7)));
        assert_eq!(c.resolve("steps.missing"), None);
        assert_eq!(c.resolve("vars"), None);
    }

    #[test]
    fn snapshot_is_isolated() {
        let mut c = ctx();
        c.set_variable("shared", json!("before"));
        let mut branch = c.snapshot();
        branch.set_variable("shared", json!("branch"));
        branch
            .record_step_result(StepResult::completed("b", json!(null), 0))
            .unwrap();

        assert_eq!(c.get_variable("shared"), Some(&json!("before")));
        assert!(!c.has_result("b"));
    }

    #[test]
    fn disjoint_branch_results_all_survive() {
        let mut c = ctx();
        c.record_step_result(StepResult::completed("up", json!(0), 0)).unwrap();

        let mut a = c.snapshot();
        a.record_step_result(StepResult::completed("a", json!("A"), 0)).unwrap();
        let mut b = c.snapshot();
        b.record_step_result(StepResult::completed("b", json!("B"), 0)).unwrap();

        c.merge_branches(vec![b, a], VariableMerge::LastWriterWins).unwrap();
        assert_eq!(c.step_output("a"), Some(&json!("A")));
        assert_eq!(c.step_output("b"), Some(&json!("B")));
        assert_eq!(c.execution_order(), &["up", "b", "a"]);
    }

    #[test]
    fn last_writer_by_completion_order_wins() {
        let mut c = ctx();
        let mut first = c.snapshot();
        first.set_variable("winner", json!("first"));
        let mut second = c.snapshot();
        second.set_variable("winner", json!("second"));

        // `second` finished later.
        c.merge_branches(vec![first, second], VariableMerge::LastWriterWins)
            .unwrap();
        assert_eq!(c.get_variable("winner"), Some(&json!("second")));
    }

    #[test]
    fn unwritten_variables_do_not_clobber() {
        let mut c = ctx();
        c.set_variable("x", json!(1));
        let a = c.snapshot();
        let mut b = c.snapshot();
        b.set_variable("x", json!(2));
        c.merge_branches(vec![b, a], VariableMerge::LastWriterWins).unwrap();
        assert_eq!(c.get_variable("x"), Some(&json!(2)));
    }

    #[test]
    fn exclusive_policy_rejects_shared_writes() {
        let mut c = ctx();
        let mut a = c.snapshot();
        a.set_variable("x", json!(1));
        let mut b = c.snapshot();
        b.set_variable("x", json!(2));
        let err = c
            .merge_branches(vec![a, b], VariableMerge::Exclusive)
            .unwrap_err();
        assert!(matches!(err, WeaverError::VariableConflict(ref n) if n == "x"));
        assert_eq!(c.get_variable("x"), None);
    }

    #[test]
    fn render_fills_placeholders() {
        let mut c = ctx();
        c.set_variable("topic", json!("rust"));
        assert_eq!(
            c.render("Hi {{ input.user.name }}, about {{topic}} ({{ input.items }})"),
            "Hi ada, about rust ([1,2,3])"
        );
    }
}
