use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::ChangeTypeCommandCalculator;
use crate::change::{Change, ChangeKey, ChangePair, IncrementalInfo, ObjectKey};
use crate::change_type::{ChangeType, MIGRATION};
use crate::checksum::normalize_whitespace;
use crate::command::{AuditCommand, ChangeCommand, ChangeWarning, ExecuteCommand, WarningKind};
use crate::error::{CairnError, Result};

/// Calculator for incremental change types (tables, migrations, indexes, foreign keys).
#[derive(Debug, Clone)]
pub struct IncrementalCalculator {
    threads: usize,
}

impl IncrementalCalculator {
    /// `threads` bounds the concurrency of each `ParallelDeploy` this calculator emits.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

fn normalized(script: Option<&str>) -> Option<String> {
    script
        .map(normalize_whitespace)
        .filter(|s| !s.is_empty())
}

fn info(change: &Change) -> Result<&IncrementalInfo> {
    change.incremental_info().ok_or_else(|| {
        CairnError::InvalidGraphInputError(format!(
            "{} is rerunnable but was passed to the incremental calculator",
            change.change_key()
        ))
    })
}

fn update_audit(change: Change, message: &str) -> ChangeCommand {
    ChangeCommand::Audit(AuditCommand::UpdateAuditOnly {
        change,
        message: message.to_string(),
    })
}

fn warning(kind: WarningKind, change: &Change) -> ChangeCommand {
    ChangeCommand::Warning(ChangeWarning::new(kind, vec![change.clone()]))
}

/// Objects whose changes are all undeployed and whose last change is an
/// unforced drop. They were never created, so there is nothing to drop.
fn already_dropped_objects(pairs: &[ChangePair]) -> HashSet<ObjectKey> {
    let mut by_object: BTreeMap<&ObjectKey, Vec<&ChangePair>> = BTreeMap::new();
    for pair in pairs {
        by_object.entry(pair.object_key()).or_default().push(pair);
    }

    by_object
        .into_iter()
        .filter(|(_, object_pairs)| {
            object_pairs
                .iter()
                .all(|p| matches!(p, ChangePair::SourceOnly(_)))
        })
        .filter(|(_, object_pairs)| {
            object_pairs
                .iter()
                .map(|p| p.change())
                .max_by_key(|c| c.order_within_object())
                .and_then(Change::incremental_info)
                .is_some_and(|last| last.drop && !last.force_drop_for_env_cleaning)
        })
        .map(|(key, _)| key.clone())
        .collect()
}

impl ChangeTypeCommandCalculator for IncrementalCalculator {
    fn calculate_commands(
        &self,
        _change_type: &ChangeType,
        pairs: Vec<ChangePair>,
        _all_source_changes: &[Change],
        rollback: bool,
        lenient_hash: bool,
    ) -> Result<Vec<ChangeCommand>> {
        let dropped_objects = already_dropped_objects(&pairs);

        let mut commands = Vec::new();
        let mut deploys: Vec<Change> = Vec::new();
        let mut new_baselines: Vec<Change> = Vec::new();
        let mut baselined_drops: Vec<Change> = Vec::new();

        for pair in pairs {
            if dropped_objects.contains(pair.object_key()) {
                if let Some(source) = pair.source() {
                    commands.push(warning(WarningKind::AlreadyDroppedTable, source));
                }
                continue;
            }

            match pair {
                ChangePair::DeployedOnly(deployed) => {
                    if lenient_hash {
                        commands.push(ChangeCommand::Audit(AuditCommand::Unmanage {
                            change: deployed,
                            message: "INIT-only".to_string(),
                        }));
                    } else if rollback {
                        if normalized(deployed.rollback_content.as_deref()).is_some() {
                            commands.push(ChangeCommand::Execute(ExecuteCommand::undeploy(
                                deployed,
                                "Running Rollback",
                            )));
                        } else {
                            commands.push(warning(WarningKind::Unrolledback, &deployed));
                        }
                    } else if deployed.change_type().eq_ignore_ascii_case(MIGRATION) {
                        commands.push(ChangeCommand::Audit(AuditCommand::Unmanage {
                            change: deployed,
                            message: "migration-only".to_string(),
                        }));
                    } else {
                        // ImproperlyRemoved unless a baseline consumes it
                        baselined_drops.push(deployed);
                    }
                }
                ChangePair::SourceOnly(source) => {
                    let source_info = info(&source)?;
                    if source_info.rollback_if_already_deployed || !source.active {
                        tracing::debug!(
                            change = %source.change_key(),
                            "Skipping undeployed change marked inactive or rollback-if-already-deployed"
                        );
                    } else if !source_info.baselined_changes.is_empty() {
                        new_baselines.push(source);
                    } else if source_info.drop {
                        if source_info.manually_coded_drop {
                            commands.push(ChangeCommand::Execute(ExecuteCommand::deploy_as_drop(source)));
                        } else {
                            let drop = !source_info.keep_incremental_order;
                            commands.push(ChangeCommand::Execute(ExecuteCommand::drop_object(source, drop)));
                        }
                    } else {
                        deploys.push(source);
                    }
                }
                ChangePair::Both { source, deployed } => {
                    if !source.hash_matches(&deployed.content_hash) {
                        if lenient_hash {
                            commands.push(update_audit(source, "initOnly"));
                        } else {
                            commands.push(ChangeCommand::Warning(ChangeWarning::new(
                                WarningKind::HashMismatch,
                                vec![source, deployed],
                            )));
                        }
                        continue;
                    }

                    let mut record = deployed.clone();
                    if source.active && !deployed.active {
                        record.active = true;
                        commands.push(update_audit(record.clone(), "Activating change"));
                    } else if !source.active && deployed.active {
                        record.active = false;
                        commands.push(update_audit(record.clone(), "Deactivating change"));
                    } else if !source.active && !deployed.active {
                        commands.push(warning(WarningKind::CurrentDeactivation, &deployed));
                    }

                    if normalized(source.rollback_content.as_deref())
                        != normalized(deployed.rollback_content.as_deref())
                    {
                        record.rollback_content = source.rollback_content.clone();
                        commands.push(update_audit(record, "Updating rollback script"));
                    }

                    if info(&source)?.rollback_if_already_deployed && source.active {
                        commands.push(ChangeCommand::Execute(ExecuteCommand::undeploy(
                            source,
                            "Rolling back due to ROLLBACK-IF-ALREADY-DEPLOYED flag.",
                        )));
                    }
                }
            }
        }

        commands.extend(handle_baselines(new_baselines, baselined_drops)?);

        let mut groups: BTreeMap<String, Vec<Change>> = BTreeMap::new();
        for change in deploys {
            match info(&change)?.parallel_group.clone() {
                Some(group) => groups.entry(group).or_default().push(change),
                None => commands.push(ChangeCommand::Execute(ExecuteCommand::deploy(change, ""))),
            }
        }
        for (_, mut members) in groups {
            if members.len() == 1 {
                let change = members.remove(0);
                commands.push(ChangeCommand::Execute(ExecuteCommand::deploy(change, "")));
            } else {
                let schema = members[0].schema().to_string();
                commands.push(ChangeCommand::Execute(ExecuteCommand::parallel_deploy(
                    &schema,
                    members,
                    self.threads,
                )));
            }
        }

        Ok(commands)
    }
}

fn handle_baselines(new_baselines: Vec<Change>, baselined_drops: Vec<Change>) -> Result<Vec<ChangeCommand>> {
    let mut drops_by_object: BTreeMap<ObjectKey, BTreeMap<String, Change>> = BTreeMap::new();
    for deployed in &baselined_drops {
        drops_by_object
            .entry(deployed.object_key().clone())
            .or_default()
            .insert(deployed.change_name().to_string(), deployed.clone());
    }

    let mut commands = Vec::new();
    let mut consumed: HashSet<ChangeKey> = HashSet::new();
    for baseline in new_baselines {
        match drops_by_object.get(baseline.object_key()) {
            None => commands.push(ChangeCommand::Execute(ExecuteCommand::deploy(baseline, ""))),
            Some(related) => {
                consumed.extend(related.values().map(|c| c.change_key().clone()));
                let missing: BTreeSet<String> = info(&baseline)?
                    .baselined_changes
                    .iter()
                    .filter(|name| !related.contains_key(*name))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    commands.push(ChangeCommand::Audit(AuditCommand::Baseline {
                        baseline,
                        replaced: related.values().cloned().collect(),
                    }));
                } else {
                    commands.push(ChangeCommand::Warning(ChangeWarning::new(
                        WarningKind::IncompleteBaseline { missing },
                        vec![baseline],
                    )));
                }
            }
        }
    }

    for deployed in &baselined_drops {
        if !consumed.contains(deployed.change_key()) {
            commands.push(warning(WarningKind::ImproperlyRemoved, deployed));
        }
    }
    Ok(commands)
}
