use std::collections::{HashMap, VecDeque};

use weaver_core::error::GraphError;
use weaver_core::step::Step;
use weaver_core::types::StepId;

/// Anything with an id and (optionally) declared predecessors.
pub trait Schedulable {
    fn id(&self) -> &str;
    /// Explicit predecessors. `None` means "after the previous node".
    fn dependencies(&self) -> Option<&[StepId]>;
}

impl Schedulable for Step {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> Option<&[StepId]> {
        self.depends_on.as_deref()
    }
}

/// Computes a dependency-respecting execution order (Kahn's algorithm).
///
/// Ties are broken by definition order, so the result is deterministic.
pub struct GraphScheduler;

impl GraphScheduler {
    pub fn order<T: Schedulable>(nodes: &[T]) -> Result<Vec<StepId>, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id(), i).is_some() {
                return Err(GraphError::DuplicateStep(node.id().to_string()));
            }
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let mut preds: Vec<usize> = match node.dependencies() {
                Some(deps) => deps
                    .iter()
                    .map(|dep| {
                        index.get(dep.as_str()).copied().ok_or_else(|| {
                            GraphError::UnknownDependency {
                                step: node.id().to_string(),
                                dependency: dep.clone(),
                            }
                        })
                    })
                    .collect::<Result<_, _>>()?,
                // Implicit sequential ordering on the previous node
                None if i > 0 => vec![i - 1],
                None => vec![],
            };
            preds.sort_unstable();
            preds.dedup();

            for pred in preds {
                successors[pred].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(n) = queue.pop_front() {
            order.push(nodes[n].id().to_string());
            for &succ in &successors[n] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() < nodes.len() {
            let members = cycle_members(&in_degree, &successors)
                .into_iter()
                .map(|i| nodes[i].id().to_string())
                .collect();
            return Err(GraphError::Cycle { members });
        }

        Ok(order)
    }
}

/// Of the nodes Kahn's algorithm could not place, keep those that lie on a
/// cycle: members of multi-node strongly connected components, and nodes
/// that depend on themselves. Nodes merely downstream of a cycle, or wedged
/// between two, are dropped.
fn cycle_members(in_degree: &[usize], successors: &[Vec<usize>]) -> Vec<usize> {
    let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    let mut tarjan = Tarjan {
        successors,
        remaining: &remaining,
        index: vec![None; remaining.len()],
        low: vec![0; remaining.len()],
        on_stack: vec![false; remaining.len()],
        stack: Vec::new(),
        next: 0,
        members: Vec::new(),
    };
    for v in 0..remaining.len() {
        if remaining[v] && tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }

    let mut members = tarjan.members;
    members.sort_unstable();
    members
}

/// Tarjan's strongly connected components over the unplaced nodes.
struct Tarjan<'a> {
    successors: &'a [Vec<usize>],
    remaining: &'a [bool],
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    members: Vec<usize>,
}

impl Tarjan<'_> {
    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.low[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let successors = self.successors;
        for &w in &successors[v] {
            if !self.remaining[w] {
                continue;
            }
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.low[v] = self.low[v].min(self.low[w]);
                }
                Some(iw) if self.on_stack[w] => self.low[v] = self.low[v].min(iw),
                Some(_) => {}
            }
        }

        if self.index[v] == Some(self.low[v]) {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            if component.len() > 1 || successors[v].contains(&v) {
                self.members.extend(component);
            }
        }
    }
}
