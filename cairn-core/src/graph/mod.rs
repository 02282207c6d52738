//! Dependency graph over changes (or groups of changes sharing an object).

pub mod enricher;
pub mod sorter;

use crate::change::{Change, ChangeKey, CodeDependency, DependencyKind};

pub type NodeId = usize;

/// A unit that takes part in dependency resolution.
pub trait SortableDependency {
    fn change_key(&self) -> &ChangeKey;
    fn order_within_object(&self) -> i32;
    fn code_dependencies(&self) -> &[CodeDependency];
}

/// A graph node made of one or more dependency components.
pub trait SortableDependencyGroup {
    type Component: SortableDependency;

    fn components(&self) -> &[Self::Component];
}

impl SortableDependency for Change {
    fn change_key(&self) -> &ChangeKey {
        Change::change_key(self)
    }

    fn order_within_object(&self) -> i32 {
        Change::order_within_object(self)
    }

    fn code_dependencies(&self) -> &[CodeDependency] {
        &self.dependencies
    }
}

impl SortableDependencyGroup for Change {
    type Component = Change;

    fn components(&self) -> &[Change] {
        std::slice::from_ref(self)
    }
}

impl<G: SortableDependencyGroup> SortableDependencyGroup for &G {
    type Component = G::Component;

    fn components(&self) -> &[G::Component] {
        (*self).components()
    }
}

/// Directed graph stored as adjacency lists. Edges point from dependency to dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph<T> {
    nodes: Vec<T>,
    outgoing: Vec<Vec<(NodeId, DependencyKind)>>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            outgoing: Vec::new(),
        }
    }
}

impl<T> DependencyGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: T) -> NodeId {
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Add `from -> to`. A repeated edge keeps the kind it was first added with.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: DependencyKind) {
        if !self.has_edge(from, to) {
            self.outgoing[from].push((to, kind));
        }
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.outgoing[from].iter().any(|(target, _)| *target == to)
    }

    pub fn edge_kind(&self, from: NodeId, to: NodeId) -> Option<DependencyKind> {
        self.outgoing[from]
            .iter()
            .find(|(target, _)| *target == to)
            .map(|(_, kind)| *kind)
    }

    pub fn node(&self, id: NodeId) -> &T {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[T] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }

    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outgoing[id].iter().map(|(target, _)| *target)
    }

    /// Every edge as `(from, to, kind)`.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, DependencyKind)> + '_ {
        self.outgoing
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| targets.iter().map(move |(to, kind)| (from, *to, *kind)))
    }

    /// Reverse every edge whose target satisfies `predicate`.
    pub fn reverse_edges_into(&mut self, predicate: impl Fn(&T) -> bool) {
        let edges: Vec<_> = self.edges().collect();
        for targets in &mut self.outgoing {
            targets.clear();
        }
        for (from, to, kind) in edges {
            if predicate(&self.nodes[to]) {
                self.add_edge(to, from, kind);
            } else {
                self.add_edge(from, to, kind);
            }
        }
    }

    pub fn into_nodes(self) -> Vec<T> {
        self.nodes
    }
}
