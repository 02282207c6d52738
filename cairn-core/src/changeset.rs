//! Full changeset: per-type calculation, ordering and changeset selection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::calc::{ChangeTypeCommandCalculator, IncrementalCalculator, RerunnableCalculator};
use crate::change::{Change, ChangeKey, ChangePair};
use crate::change_type::ChangeTypeRegistry;
use crate::command::{AuditCommand, ChangeCommand, ChangeWarning, ExecuteCommand};
use crate::command_sorter::CommandSorter;
use crate::error::{CairnError, Result};
use crate::graph::enricher::GraphEnricher;

/// Decides which executable commands run now and which are deferred.
#[derive(Clone, Default)]
pub enum ChangesetSelection {
    /// Commands touching any change without a changeset tag run now.
    #[default]
    Default,
    /// Untagged commands, plus those tagged with one of these names, run now.
    Named(BTreeSet<String>),
    All,
    Custom(Arc<dyn Fn(&ExecuteCommand) -> bool + Send + Sync>),
}

impl ChangesetSelection {
    pub fn is_immediate(&self, command: &ExecuteCommand) -> bool {
        match self {
            ChangesetSelection::Default => command.changes().iter().any(|c| c.changeset.is_none()),
            ChangesetSelection::Named(names) => command
                .changes()
                .iter()
                .any(|c| c.changeset.as_ref().is_none_or(|tag| names.contains(tag))),
            ChangesetSelection::All => true,
            ChangesetSelection::Custom(predicate) => predicate(command),
        }
    }
}

impl fmt::Debug for ChangesetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangesetSelection::Default => write!(f, "Default"),
            ChangesetSelection::Named(names) => f.debug_tuple("Named").field(names).finish(),
            ChangesetSelection::All => write!(f, "All"),
            ChangesetSelection::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// The outcome of comparing source against an environment.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// Ordered executable commands to run in this deploy.
    pub immediate: Vec<ExecuteCommand>,
    /// Ordered executable commands held back by the changeset selection.
    pub deferred: Vec<ExecuteCommand>,
    pub audits: Vec<AuditCommand>,
    pub warnings: Vec<ChangeWarning>,
}

impl Changeset {
    pub fn fatal_warnings(&self) -> impl Iterator<Item = &ChangeWarning> {
        self.warnings.iter().filter(|w| w.is_fatal())
    }

    pub fn non_fatal_warnings(&self) -> impl Iterator<Item = &ChangeWarning> {
        self.warnings.iter().filter(|w| !w.is_fatal())
    }

    /// Fail when any warning blocks deployment, listing all of them.
    pub fn validate_for_deployment(&self) -> Result<()> {
        let fatal: Vec<String> = self.fatal_warnings().map(ChangeWarning::description).collect();
        if fatal.is_empty() {
            Ok(())
        } else {
            Err(CairnError::FatalWarningsError(fatal.join("\n")))
        }
    }

    pub fn is_deployment_needed(&self) -> bool {
        !self.immediate.is_empty() || !self.audits.is_empty()
    }
}

/// Inputs to [`ChangesetCreator::determine_changeset`] besides the two change lists.
#[derive(Debug, Clone, Default)]
pub struct ChangesetOptions {
    pub rollback: bool,
    pub lenient_hash: bool,
    pub selection: ChangesetSelection,
}

pub struct ChangesetCreator<'a> {
    registry: &'a ChangeTypeRegistry,
    enricher: GraphEnricher,
    parallel_threads: usize,
}

#[derive(Default)]
struct TypeChanges {
    source: BTreeMap<ChangeKey, Change>,
    deployed: BTreeMap<ChangeKey, Change>,
}

fn insert_unique(map: &mut BTreeMap<ChangeKey, Change>, change: Change, side: &str) -> Result<()> {
    let key = change.change_key().clone();
    if map.insert(key.clone(), change).is_some() {
        return Err(CairnError::InvalidGraphInputError(format!(
            "{} change {} appears more than once",
            side, key
        )));
    }
    Ok(())
}

impl<'a> ChangesetCreator<'a> {
    pub fn new(registry: &'a ChangeTypeRegistry, enricher: GraphEnricher, parallel_threads: usize) -> Self {
        Self {
            registry,
            enricher,
            parallel_threads,
        }
    }

    /// Compare `sources` with `deployed` and produce the ordered changeset.
    ///
    /// `all_sources` is the unfiltered source, used to tell a deselected
    /// object from a removed one.
    pub fn determine_changeset(
        &self,
        deployed: Vec<Change>,
        sources: Vec<Change>,
        all_sources: &[Change],
        options: &ChangesetOptions,
    ) -> Result<Changeset> {
        let mut by_type: BTreeMap<String, TypeChanges> = BTreeMap::new();
        for change in sources {
            let entry = by_type.entry(change.change_type().to_string()).or_default();
            insert_unique(&mut entry.source, change, "Source")?;
        }
        for change in deployed {
            let entry = by_type.entry(change.change_type().to_string()).or_default();
            insert_unique(&mut entry.deployed, change, "Deployed")?;
        }

        let incremental = IncrementalCalculator::new(self.parallel_threads);
        let rerunnable = RerunnableCalculator::new(self.enricher);

        let mut commands = Vec::new();
        for (type_name, TypeChanges { mut source, mut deployed }) in by_type {
            let change_type = self.registry.get(&type_name)?;
            let keys: BTreeSet<ChangeKey> = source.keys().chain(deployed.keys()).cloned().collect();
            let pairs: Vec<ChangePair> = keys
                .iter()
                .filter_map(|key| ChangePair::new(source.remove(key), deployed.remove(key)))
                .collect();

            let calculator: &dyn ChangeTypeCommandCalculator = if change_type.rerunnable {
                &rerunnable
            } else {
                &incremental
            };
            let emitted = calculator.calculate_commands(
                change_type,
                pairs,
                all_sources,
                options.rollback,
                options.lenient_hash,
            )?;
            tracing::debug!(change_type = %type_name, commands = emitted.len(), "Calculated commands");
            commands.extend(emitted);
        }

        let mut executes = Vec::new();
        let mut changeset = Changeset::default();
        for command in commands {
            match command {
                ChangeCommand::Execute(cmd) => executes.push(cmd),
                ChangeCommand::Audit(cmd) => changeset.audits.push(cmd),
                ChangeCommand::Warning(warning) => changeset.warnings.push(warning),
            }
        }

        let sorted = CommandSorter::new(self.registry, self.enricher).sort(executes, options.rollback)?;
        let (immediate, deferred): (Vec<_>, Vec<_>) = sorted
            .into_iter()
            .partition(|cmd| options.selection.is_immediate(cmd));
        changeset.immediate = immediate;
        changeset.deferred = deferred;

        tracing::info!(
            immediate = changeset.immediate.len(),
            deferred = changeset.deferred.len(),
            audits = changeset.audits.len(),
            warnings = changeset.warnings.len(),
            "Changeset determined"
        );
        Ok(changeset)
    }
}
