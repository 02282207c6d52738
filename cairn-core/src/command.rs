//! Commands emitted by the changeset calculators, their execution and audit marking.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::audit::{ChangeAuditDao, DeployExecution};
use crate::change::Change;
use crate::change_type::ChangeTypeRegistry;
use crate::error::{CairnError, Result};
use crate::graph::SortableDependencyGroup;
use crate::tokens::render_for_schema;

/// Runs SQL against the target environment.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute `sql` with `schema` as the default schema.
    async fn execute(&self, schema: &str, sql: &str) -> Result<()>;
}

/// Everything an [`ExecuteCommand`] needs at execution time.
pub struct ExecutionContext<'a> {
    pub executor: &'a dyn SqlExecutor,
    pub registry: &'a ChangeTypeRegistry,
    pub tokens: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAction {
    Deploy { change: Change, message: String },
    Undeploy { change: Change, message: String },
    DropObject { change: Change },
    ParallelDeploy { schema: String, changes: Vec<Change>, threads: usize },
}

/// A command that runs SQL. `drop` marks it for the drop phase of ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteCommand {
    pub action: ExecuteAction,
    pub drop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditCommand {
    UpdateAuditOnly { change: Change, message: String },
    Baseline { baseline: Change, replaced: Vec<Change> },
    Unmanage { change: Change, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    HashMismatch,
    ImproperlyRemoved,
    IncompleteBaseline { missing: BTreeSet<String> },
    Unrolledback,
    CurrentDeactivation,
    AlreadyDroppedTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeWarning {
    pub kind: WarningKind,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeCommand {
    Execute(ExecuteCommand),
    Audit(AuditCommand),
    Warning(ChangeWarning),
}

fn with_message(text: String, message: &str) -> String {
    if message.is_empty() {
        text
    } else {
        format!("{} ({})", text, message)
    }
}

fn key_list(changes: &[Change]) -> String {
    changes
        .iter()
        .map(|c| c.change_key().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ExecuteCommand {
    pub fn deploy(change: Change, message: &str) -> Self {
        Self {
            action: ExecuteAction::Deploy {
                change,
                message: message.to_string(),
            },
            drop: false,
        }
    }

    /// Deploy a manually coded drop; ordered with the drops.
    pub fn deploy_as_drop(change: Change) -> Self {
        Self {
            action: ExecuteAction::Deploy {
                change,
                message: String::new(),
            },
            drop: true,
        }
    }

    pub fn undeploy(change: Change, message: &str) -> Self {
        Self {
            action: ExecuteAction::Undeploy {
                change,
                message: message.to_string(),
            },
            drop: false,
        }
    }

    pub fn drop_object(change: Change, drop: bool) -> Self {
        Self {
            action: ExecuteAction::DropObject { change },
            drop,
        }
    }

    pub fn parallel_deploy(schema: &str, changes: Vec<Change>, threads: usize) -> Self {
        Self {
            action: ExecuteAction::ParallelDeploy {
                schema: schema.to_string(),
                changes,
                threads,
            },
            drop: false,
        }
    }

    pub fn changes(&self) -> &[Change] {
        match &self.action {
            ExecuteAction::Deploy { change, .. }
            | ExecuteAction::Undeploy { change, .. }
            | ExecuteAction::DropObject { change } => std::slice::from_ref(change),
            ExecuteAction::ParallelDeploy { changes, .. } => changes,
        }
    }

    pub fn description(&self) -> String {
        match &self.action {
            ExecuteAction::Deploy { change, message } => {
                with_message(format!("Deploy {}", change.change_key()), message)
            }
            ExecuteAction::Undeploy { change, message } => {
                with_message(format!("Undeploy {}", change.change_key()), message)
            }
            ExecuteAction::DropObject { change } => format!("Drop {}", change.object_key()),
            ExecuteAction::ParallelDeploy {
                schema,
                changes,
                threads,
            } => format!(
                "Parallel deploy in {} with {} thread(s): {}",
                schema,
                threads,
                key_list(changes)
            ),
        }
    }

    /// Run the command's SQL.
    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        match &self.action {
            ExecuteAction::Deploy { change, .. } => deploy_change(ctx, change).await,
            ExecuteAction::Undeploy { change, .. } => {
                let rollback = change
                    .rollback_content
                    .as_deref()
                    .ok_or_else(|| CairnError::MissingRollbackError(change.change_key().to_string()))?;
                run(ctx, change, rollback).await
            }
            ExecuteAction::DropObject { change } => {
                let sql = ctx.registry.get(change.change_type())?.drop_sql(change)?;
                run(ctx, change, &sql).await
            }
            ExecuteAction::ParallelDeploy { changes, threads, .. } => {
                if changes.len() < 2 {
                    for change in changes {
                        deploy_change(ctx, change).await?;
                    }
                    return Ok(());
                }
                tracing::debug!(changes = changes.len(), threads, "Running parallel deploy");
                futures::stream::iter(changes.iter().map(Ok::<_, CairnError>))
                    .try_for_each_concurrent((*threads).max(1), |change| deploy_change(ctx, change))
                    .await
            }
        }
    }
}

async fn deploy_change(ctx: &ExecutionContext<'_>, change: &Change) -> Result<()> {
    run(ctx, change, &change.content).await
}

async fn run(ctx: &ExecutionContext<'_>, change: &Change, sql: &str) -> Result<()> {
    if sql.trim().is_empty() {
        tracing::debug!(change = %change.change_key(), "Nothing to execute");
        return Ok(());
    }
    let rendered = render_for_schema(sql, ctx.tokens, change.schema())?;
    tracing::debug!(change = %change.change_key(), "Executing SQL");
    ctx.executor
        .execute(change.schema(), &rendered)
        .await
        .map_err(|e| CairnError::CommandFailed {
            command: change.change_key().to_string(),
            reason: e.to_string(),
        })
}

impl fmt::Display for ExecuteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl SortableDependencyGroup for ExecuteCommand {
    type Component = Change;

    fn components(&self) -> &[Change] {
        self.changes()
    }
}

impl AuditCommand {
    pub fn changes(&self) -> Vec<&Change> {
        match self {
            AuditCommand::UpdateAuditOnly { change, .. } | AuditCommand::Unmanage { change, .. } => {
                vec![change]
            }
            AuditCommand::Baseline { baseline, replaced } => {
                std::iter::once(baseline).chain(replaced.iter()).collect()
            }
        }
    }

    pub fn description(&self) -> String {
        match self {
            AuditCommand::UpdateAuditOnly { change, message } => {
                with_message(format!("Update audit record of {}", change.change_key()), message)
            }
            AuditCommand::Baseline { baseline, replaced } => format!(
                "Baseline {} replacing {}",
                baseline.change_key(),
                replaced
                    .iter()
                    .map(|c| c.change_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            AuditCommand::Unmanage { change, message } => {
                with_message(format!("Stop managing {}", change.change_key()), message)
            }
        }
    }
}

impl ChangeWarning {
    pub fn new(kind: WarningKind, changes: Vec<Change>) -> Self {
        Self { kind, changes }
    }

    /// Fatal warnings block deployment.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            WarningKind::HashMismatch | WarningKind::ImproperlyRemoved | WarningKind::IncompleteBaseline { .. }
        )
    }

    pub fn description(&self) -> String {
        let keys = key_list(&self.changes);
        match &self.kind {
            WarningKind::HashMismatch => format!(
                "Change was modified after it was deployed; revert the edit or add a new change instead: {}",
                keys
            ),
            WarningKind::ImproperlyRemoved => format!(
                "Deployed change is missing from source; restore it, or mark it inactive to roll it back: {}",
                keys
            ),
            WarningKind::IncompleteBaseline { missing } => format!(
                "Baseline replaces changes that are only partly deployed; missing {}: {}",
                missing.iter().cloned().collect::<Vec<_>>().join(", "),
                keys
            ),
            WarningKind::Unrolledback => format!(
                "Change removed from source has no rollback script and stays deployed: {}",
                keys
            ),
            WarningKind::CurrentDeactivation => format!(
                "Change is inactive in source and already inactive in the environment: {}",
                keys
            ),
            WarningKind::AlreadyDroppedTable => format!(
                "Object ends in a drop and was never deployed; nothing to do: {}",
                keys
            ),
        }
    }
}

impl ChangeCommand {
    pub fn changes(&self) -> Vec<&Change> {
        match self {
            ChangeCommand::Execute(cmd) => cmd.changes().iter().collect(),
            ChangeCommand::Audit(cmd) => cmd.changes(),
            ChangeCommand::Warning(warning) => warning.changes.iter().collect(),
        }
    }

    pub fn description(&self) -> String {
        match self {
            ChangeCommand::Execute(cmd) => cmd.description(),
            ChangeCommand::Audit(cmd) => cmd.description(),
            ChangeCommand::Warning(warning) => warning.description(),
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, ChangeCommand::Execute(cmd) if cmd.drop)
    }

    /// Record the effect of this command in the audit store.
    pub async fn mark_audit_table(
        &self,
        dao: &dyn ChangeAuditDao,
        execution: &DeployExecution,
    ) -> Result<()> {
        match self {
            ChangeCommand::Execute(cmd) => match &cmd.action {
                ExecuteAction::Deploy { change, .. } => record_deploy(dao, change, execution).await,
                ExecuteAction::Undeploy { change, .. } => dao.delete_change(change).await,
                ExecuteAction::DropObject { change } => dao.delete_object_changes(change).await,
                ExecuteAction::ParallelDeploy { changes, .. } => {
                    for change in changes {
                        record_deploy(dao, change, execution).await?;
                    }
                    Ok(())
                }
            },
            ChangeCommand::Audit(cmd) => match cmd {
                AuditCommand::UpdateAuditOnly { change, .. } => {
                    dao.update_or_insert_change(change, execution).await
                }
                AuditCommand::Baseline { baseline, replaced } => {
                    dao.insert_new_change(baseline, execution).await?;
                    for change in replaced {
                        dao.delete_change(change).await?;
                    }
                    Ok(())
                }
                AuditCommand::Unmanage { change, .. } => dao.delete_change(change).await,
            },
            ChangeCommand::Warning(_) => Ok(()),
        }
    }
}

async fn record_deploy(dao: &dyn ChangeAuditDao, change: &Change, execution: &DeployExecution) -> Result<()> {
    if change.is_rerunnable() {
        dao.update_or_insert_change(change, execution).await
    } else {
        dao.insert_new_change(change, execution).await
    }
}

impl fmt::Display for ChangeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
