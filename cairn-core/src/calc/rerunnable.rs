use std::collections::{BTreeMap, HashSet, VecDeque};

use super::ChangeTypeCommandCalculator;
use crate::change::{Change, ChangePair, ObjectKey};
use crate::change_type::ChangeType;
use crate::command::{AuditCommand, ChangeCommand, ExecuteCommand};
use crate::error::Result;
use crate::graph::enricher::{GraphEnricher, UnresolvedDependencyPolicy};

/// Calculator for rerunnable change types (views, functions, procedures, ...).
#[derive(Debug, Clone, Copy)]
pub struct RerunnableCalculator {
    enricher: GraphEnricher,
}

impl RerunnableCalculator {
    pub fn new(enricher: GraphEnricher) -> Self {
        // the source graph of a single type is partial by nature; missing targets are expected
        Self {
            enricher: enricher.with_unresolved_policy(UnresolvedDependencyPolicy::Ignore),
        }
    }

    /// Unchanged source objects that depend, directly or transitively, on a changed one.
    ///
    /// Returns each dependent with the name of the changed object that pulled it in.
    fn dependents_to_redeploy(
        &self,
        change_type: &ChangeType,
        all_source_changes: &[Change],
        changed: &[Change],
    ) -> Result<Vec<(Change, String)>> {
        let of_type: Vec<&Change> = all_source_changes
            .iter()
            .filter(|c| c.change_type() == change_type.name)
            .collect();
        if of_type.is_empty() {
            return Ok(Vec::new());
        }

        let graph = self.enricher.create_dependency_graph(of_type, false)?;
        let changed_keys: HashSet<&ObjectKey> = changed.iter().map(Change::object_key).collect();

        let mut dependents: BTreeMap<ObjectKey, (Change, String)> = BTreeMap::new();
        for change in changed.iter().filter(|c| !c.is_create_or_replace()) {
            let Some(start) = graph
                .nodes()
                .iter()
                .position(|node| node.change_key() == change.change_key())
            else {
                continue;
            };

            let mut visited = HashSet::from([start]);
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                for next in graph.successors(node) {
                    if visited.insert(next) {
                        queue.push_back(next);
                        let dependent = *graph.node(next);
                        if !changed_keys.contains(dependent.object_key()) {
                            dependents
                                .entry(dependent.object_key().clone())
                                .or_insert_with(|| (dependent.clone(), change.object_name().to_string()));
                        }
                    }
                }
            }
        }
        Ok(dependents.into_values().collect())
    }
}

impl ChangeTypeCommandCalculator for RerunnableCalculator {
    fn calculate_commands(
        &self,
        change_type: &ChangeType,
        pairs: Vec<ChangePair>,
        all_source_changes: &[Change],
        _rollback: bool,
        _lenient_hash: bool,
    ) -> Result<Vec<ChangeCommand>> {
        let mut dropped = Vec::new();
        let mut changed = Vec::new();

        for pair in pairs {
            match pair {
                ChangePair::DeployedOnly(deployed) => dropped.push(deployed),
                ChangePair::SourceOnly(source) => changed.push(source),
                ChangePair::Both { source, deployed } => {
                    if source.hash_matches(&deployed.content_hash) {
                        tracing::trace!(object = %source.object_key(), "Source and deployed hashes match");
                    } else {
                        changed.push(source);
                    }
                }
            }
        }

        let source_objects: HashSet<&ObjectKey> =
            all_source_changes.iter().map(Change::object_key).collect();

        let mut commands = Vec::new();
        for deployed in dropped {
            if source_objects.contains(deployed.object_key()) {
                tracing::debug!(object = %deployed.object_key(), "Object outside the current selection; not dropping");
                continue;
            }
            if change_type.can_drop(&deployed) {
                commands.push(ChangeCommand::Execute(ExecuteCommand::drop_object(deployed, true)));
            } else {
                // nothing to run; the object is left in place and forgotten
                commands.push(ChangeCommand::Audit(AuditCommand::Unmanage {
                    change: deployed,
                    message: format!("no drop statement for {}", change_type.name),
                }));
            }
        }

        if change_type.dependent_recalculation {
            for (dependent, cause) in self.dependents_to_redeploy(change_type, all_source_changes, &changed)? {
                let message = format!(
                    "Re-deploying this object due to change in dependent object [{}]",
                    cause
                );
                commands.push(ChangeCommand::Execute(ExecuteCommand::deploy(dependent, &message)));
            }
        }

        commands.extend(
            changed
                .into_iter()
                .map(|source| ChangeCommand::Execute(ExecuteCommand::deploy(source, ""))),
        );
        Ok(commands)
    }
}
