//! Resolves textual dependency references into a [`DependencyGraph`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{DependencyGraph, NodeId, SortableDependency, SortableDependencyGroup};
use crate::change::{ChangeKey, DependencyKind};
use crate::change_type::{FOREIGN_KEY, TABLE};
use crate::error::{CairnError, Result};

/// How object names are folded before lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameCase {
    Exact,
    Upper,
    /// PostgreSQL folds unquoted identifiers to lower case.
    #[default]
    Lower,
}

impl NameCase {
    pub fn normalize(&self, name: &str) -> String {
        match self {
            NameCase::Exact => name.to_string(),
            NameCase::Upper => name.to_uppercase(),
            NameCase::Lower => name.to_lowercase(),
        }
    }
}

/// What to do with a dependency reference that names no known change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedDependencyPolicy {
    #[default]
    Ignore,
    Warn,
    Fail,
}

/// Builds dependency graphs from groups of changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphEnricher {
    name_case: NameCase,
    unresolved: UnresolvedDependencyPolicy,
}

/// Lookup tables consulted in order when resolving a reference.
#[derive(Default)]
struct ChangeIndexes {
    /// (schema, object) -> highest-order node
    object: HashMap<(String, String), (NodeId, i32, ChangeKey)>,
    /// "schema.object" -> highest-order node
    schema_object: HashMap<String, (NodeId, i32, ChangeKey)>,
    /// (schema, "object.change") -> node
    object_change: HashMap<(String, String), NodeId>,
    /// "schema.object.change" -> node
    schema_object_change: HashMap<String, NodeId>,
}

fn keep_latest<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, (NodeId, i32, ChangeKey)>,
    key: K,
    candidate: (NodeId, i32, ChangeKey),
) {
    let replace = match index.get(&key) {
        None => true,
        Some((_, order, change_key)) => (candidate.1, &candidate.2) > (*order, change_key),
    };
    if replace {
        index.insert(key, candidate);
    }
}

impl ChangeIndexes {
    fn add(&mut self, node: NodeId, component: &impl SortableDependency, name_case: NameCase) {
        let key = component.change_key();
        let schema = key.object_key.schema.clone();
        let object = &key.object_key.object_name;
        let order = component.order_within_object();

        keep_latest(
            &mut self.object,
            (schema.clone(), name_case.normalize(object)),
            (node, order, key.clone()),
        );
        keep_latest(
            &mut self.schema_object,
            name_case.normalize(&format!("{}.{}", schema, object)),
            (node, order, key.clone()),
        );
        self.object_change.insert(
            (schema.clone(), name_case.normalize(&format!("{}.{}", object, key.change_name))),
            node,
        );
        self.schema_object_change.insert(
            name_case.normalize(&format!("{}.{}.{}", schema, object, key.change_name)),
            node,
        );
    }

    fn retrieve(&self, schema: &str, target: &str) -> Option<NodeId> {
        let target = target.to_string();
        self.object
            .get(&(schema.to_string(), target.clone()))
            .map(|(node, _, _)| *node)
            .or_else(|| self.schema_object.get(&target).map(|(node, _, _)| *node))
            .or_else(|| self.object_change.get(&(schema.to_string(), target.clone())).copied())
            .or_else(|| self.schema_object_change.get(&target).copied())
    }
}

impl GraphEnricher {
    pub fn new(name_case: NameCase) -> Self {
        Self {
            name_case,
            unresolved: UnresolvedDependencyPolicy::default(),
        }
    }

    pub fn with_unresolved_policy(mut self, policy: UnresolvedDependencyPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    /// Build the dependency graph for `groups`.
    ///
    /// In rollback mode the implicit order between changes of the same
    /// incremental object is reversed. No cycle check happens here.
    pub fn create_dependency_graph<G: SortableDependencyGroup>(
        &self,
        groups: impl IntoIterator<Item = G>,
        rollback: bool,
    ) -> Result<DependencyGraph<G>> {
        let mut graph = DependencyGraph::new();
        for group in groups {
            graph.add_node(group);
        }

        let mut seen: HashMap<ChangeKey, NodeId> = HashMap::new();
        let mut indexes = ChangeIndexes::default();
        for (node, group) in graph.nodes().iter().enumerate() {
            for component in group.components() {
                if seen.insert(component.change_key().clone(), node).is_some() {
                    return Err(CairnError::InvalidGraphInputError(format!(
                        "change {} was registered more than once",
                        component.change_key()
                    )));
                }
                indexes.add(node, component, self.name_case);
            }
        }

        let mut edges: Vec<(NodeId, NodeId, DependencyKind)> = Vec::new();
        for (node, group) in graph.nodes().iter().enumerate() {
            for component in group.components() {
                let key = component.change_key();
                for dependency in component.code_dependencies() {
                    let target = self.name_case.normalize(&dependency.target);
                    match indexes.retrieve(&key.object_key.schema, &target) {
                        Some(found) if found == node => {}
                        Some(found) => {
                            tracing::trace!(from = %found, to = %key, kind = %dependency.kind, "Resolved dependency");
                            edges.push((found, node, dependency.kind));
                        }
                        None => match self.unresolved {
                            UnresolvedDependencyPolicy::Ignore => {
                                tracing::debug!(change = %key, target = %dependency.target, "Dependency not found among the changes being graphed");
                            }
                            UnresolvedDependencyPolicy::Warn => {
                                tracing::warn!(change = %key, target = %dependency.target, "Dependency not found among the changes being graphed");
                            }
                            UnresolvedDependencyPolicy::Fail => {
                                return Err(CairnError::UnresolvedDependencyError {
                                    change: key.to_string(),
                                    target: dependency.target.clone(),
                                });
                            }
                        },
                    }
                }
            }
        }

        // Order within an incremental object; FOREIGN_KEY sections belong to their table.
        let mut by_object: BTreeMap<String, Vec<(i32, ChangeKey, NodeId)>> = BTreeMap::new();
        for (node, group) in graph.nodes().iter().enumerate() {
            for component in group.components() {
                let object_key = &component.change_key().object_key;
                let change_type = if object_key.change_type == FOREIGN_KEY {
                    TABLE
                } else {
                    object_key.change_type.as_str()
                };
                let group_key = format!(
                    "{}:{}:{}",
                    change_type,
                    object_key.schema,
                    self.name_case.normalize(&object_key.object_name)
                );
                by_object.entry(group_key).or_default().push((
                    component.order_within_object(),
                    component.change_key().clone(),
                    node,
                ));
            }
        }
        for members in by_object.values_mut() {
            members.sort();
            for pair in members.windows(2) {
                let (prev, next) = (pair[0].2, pair[1].2);
                if prev == next {
                    continue;
                }
                if rollback {
                    edges.push((next, prev, DependencyKind::Implicit));
                } else {
                    edges.push((prev, next, DependencyKind::Implicit));
                }
            }
        }

        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }
        Ok(graph)
    }
}
