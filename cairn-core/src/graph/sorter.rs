//! Deterministic topological sort with cycle reporting.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::fmt;

use super::{DependencyGraph, NodeId};
use crate::error::{CairnError, Result};

const CYCLE_HEADER: &str = "Found cycles for the changes below. Please correct the object content.
You can remediate by:
    A) manually excluding false dependencies (likely the DISCOVERED dependencies) using //// METADATA excludeDependencies=A,B,C or
    B) defining appropriate dependencies using the METADATA includeDependencies or dependencies attributes
    C) excluding unnecessary EXPLICIT dependency types

Changes are marked as [objectName.changeName]

Overview of dependency types:
 * DISCOVERED: dependencies found through the text code analysis.
       These are the likeliest candidates for causing cycles.
       Use excludeDependencies on the object name (not the change name) if needed on this
 * EXPLICIT: user-defined dependencies set via the includeDependencies or dependencies attributes
 * IMPLICIT: implied change dependencies determined by the order within incremental table changes
";

/// Sort using the nodes' natural order to break ties.
pub fn sort<T: Ord + fmt::Display>(graph: &DependencyGraph<T>) -> Result<Vec<&T>> {
    let order = sort_with(graph, |a, b| a.cmp(b))?;
    Ok(order.into_iter().map(|id| graph.node(id)).collect())
}

/// Kahn's algorithm: the ready node that is least under `cmp` is emitted next.
///
/// Two distinct ready nodes comparing equal fail with `UnsortableElementsError`.
/// Leftover nodes are reported as a `GraphCycleError`.
pub fn sort_with<T, F>(graph: &DependencyGraph<T>, mut cmp: F) -> Result<Vec<NodeId>>
where
    T: fmt::Display,
    F: FnMut(&T, &T) -> Ordering,
{
    let count = graph.node_count();
    let mut in_degree = vec![0usize; count];
    for (_, to, _) in graph.edges() {
        in_degree[to] += 1;
    }

    let mut ready: Vec<NodeId> = (0..count).filter(|&n| in_degree[n] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while !ready.is_empty() {
        let mut best = 0;
        let mut tied = None;
        for i in 1..ready.len() {
            match cmp(graph.node(ready[i]), graph.node(ready[best])) {
                Ordering::Less => {
                    best = i;
                    tied = None;
                }
                Ordering::Equal => tied = Some(i),
                Ordering::Greater => {}
            }
        }
        if let Some(other) = tied {
            return Err(CairnError::UnsortableElementsError(format!(
                "{} and {} compare as equal; the sort order would depend on input order",
                graph.node(ready[best]),
                graph.node(ready[other])
            )));
        }

        let next = ready.swap_remove(best);
        order.push(next);
        for successor in graph.successors(next) {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                ready.push(successor);
            }
        }
    }

    if order.len() < count {
        let emitted: HashSet<NodeId> = order.iter().copied().collect();
        let remaining: Vec<NodeId> = (0..count).filter(|n| !emitted.contains(n)).collect();
        return Err(cycle_error(graph, &remaining));
    }

    Ok(order)
}

/// Sort the full graph, then keep only `subset`, preserving the full-graph order.
pub fn sort_subset_with<T, F>(graph: &DependencyGraph<T>, subset: &[NodeId], cmp: F) -> Result<Vec<NodeId>>
where
    T: fmt::Display,
    F: FnMut(&T, &T) -> Ordering,
{
    let mut wanted = HashSet::with_capacity(subset.len());
    for &node in subset {
        if !wanted.insert(node) {
            return Err(CairnError::InvalidGraphInputError(format!(
                "{} appears more than once in the requested subset",
                graph.node(node)
            )));
        }
    }
    let order = sort_with(graph, cmp)?;
    Ok(order.into_iter().filter(|n| wanted.contains(n)).collect())
}

/// Strongly connected components of the subgraph induced by `nodes`.
fn tarjan<T>(graph: &DependencyGraph<T>, nodes: &[NodeId]) -> Vec<Vec<NodeId>> {
    struct State<'g, T> {
        graph: &'g DependencyGraph<T>,
        members: HashSet<NodeId>,
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<NodeId>,
        next_index: usize,
        components: Vec<Vec<NodeId>>,
    }

    impl<T> State<'_, T> {
        fn visit(&mut self, v: NodeId) {
            self.index[v] = Some(self.next_index);
            self.low[v] = self.next_index;
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            let successors: Vec<NodeId> = self
                .graph
                .successors(v)
                .filter(|w| self.members.contains(w))
                .collect();
            for w in successors {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    }
                    Some(w_index) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(w_index);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let count = graph.node_count();
    let mut state = State {
        graph,
        members: nodes.iter().copied().collect(),
        index: vec![None; count],
        low: vec![0; count],
        on_stack: vec![false; count],
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for &node in nodes {
        if state.index[node].is_none() {
            state.visit(node);
        }
    }
    state.components
}

/// Walk "depends on" edges inside `component` from its first member back to itself.
fn cycle_walk<T>(graph: &DependencyGraph<T>, component: &[NodeId]) -> Vec<NodeId> {
    let start = component[0];
    if graph.has_edge(start, start) {
        return vec![start, start];
    }
    let members: HashSet<NodeId> = component.iter().copied().collect();
    // x depends on y when there is an edge y -> x
    let depends_on = |x: NodeId| -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = component
            .iter()
            .copied()
            .filter(|&y| members.contains(&y) && graph.has_edge(y, x))
            .collect();
        deps.sort();
        deps
    };

    let mut parent: Vec<Option<NodeId>> = vec![None; graph.node_count()];
    let mut queue = VecDeque::from([start]);
    let mut visited = HashSet::from([start]);
    while let Some(x) = queue.pop_front() {
        for y in depends_on(x) {
            if y == start {
                let mut path = vec![start];
                let mut cursor = Some(x);
                let mut reversed = Vec::new();
                while let Some(node) = cursor {
                    if node == start {
                        break;
                    }
                    reversed.push(node);
                    cursor = parent[node];
                }
                reversed.reverse();
                path.extend(reversed);
                path.push(start);
                return path;
            }
            if visited.insert(y) {
                parent[y] = Some(x);
                queue.push_back(y);
            }
        }
    }
    vec![start]
}

fn cycle_error<T: fmt::Display>(graph: &DependencyGraph<T>, remaining: &[NodeId]) -> CairnError {
    let mut components: Vec<Vec<NodeId>> = tarjan(graph, remaining)
        .into_iter()
        .filter(|c| c.len() > 1 || graph.has_edge(c[0], c[0]))
        .map(|mut c| {
            c.sort_by_key(|&n| graph.node(n).to_string());
            c
        })
        .collect();
    components.sort_by_key(|c| graph.node(c[0]).to_string());

    let mut message = String::from(CYCLE_HEADER);
    let mut cycles = Vec::with_capacity(components.len());
    for (i, component) in components.iter().enumerate() {
        message.push_str(&format!("\nCycle #{}:", i + 1));
        let walk = cycle_walk(graph, component);
        for pair in walk.windows(2) {
            let (dependent, dependency) = (pair[0], pair[1]);
            let kind = graph
                .edge_kind(dependency, dependent)
                .map_or_else(|| "UNKNOWN".to_string(), |k| k.to_string());
            message.push_str(&format!(
                "\n    {} == depends on ==> {}   ({} dependency)",
                graph.node(dependent),
                graph.node(dependency),
                kind
            ));
        }
        message.push_str(" (CYCLE FORMED)");
        cycles.push(component.iter().map(|&n| graph.node(n).to_string()).collect());
    }

    CairnError::GraphCycleError { message, cycles }
}
