use std::collections::BTreeSet;
use std::time::Instant;

use serde::Serialize;
use tokio_postgres::Client;

use crate::audit::{ChangeAuditDao, DeployExecution};
use crate::change::Change;
use crate::change_type::ChangeTypeRegistry;
use crate::changeset::{Changeset, ChangesetCreator, ChangesetOptions};
use crate::command::{ChangeCommand, ExecuteAction, ExecutionContext};
use crate::config::{CairnConfig, ChangesetsConfig};
use crate::db::{self, PgSqlExecutor};
use crate::error::{CairnError, Result};
use crate::graph::enricher::GraphEnricher;
use crate::history::PgAuditDao;
use crate::reader::SourceReader;
use crate::tokens::build_tokens;

/// Per-run deploy switches on top of the configuration.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub rollback: bool,
    /// Plan and report without executing anything.
    pub dry_run: bool,
    /// Overrides the configured changeset selection.
    pub changesets: Option<ChangesetsConfig>,
    /// `schema.object` names; empty means every object.
    pub only: Vec<String>,
    pub lenient_hash: bool,
    pub reason: Option<String>,
}

/// Report returned after a deploy.
#[derive(Debug, Default, Serialize)]
pub struct DeployReport {
    pub execution_id: Option<String>,
    pub dry_run: bool,
    pub rollback: bool,
    pub executed: Vec<DeployDetail>,
    pub audits: Vec<String>,
    pub warnings: Vec<String>,
    pub deferred: usize,
    pub total_time_ms: i32,
}

#[derive(Debug, Serialize)]
pub struct DeployDetail {
    pub command: String,
    pub changes: usize,
    pub execution_time_ms: i32,
}

/// Restricts a deploy to named objects.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    objects: BTreeSet<(String, String)>,
}

impl ObjectFilter {
    /// Parse `schema.object` entries; names are compared case-insensitively.
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut objects = BTreeSet::new();
        for entry in entries {
            let (schema, object) = entry
                .split_once('.')
                .filter(|(s, o)| !s.is_empty() && !o.is_empty())
                .ok_or_else(|| {
                    CairnError::ConfigError(format!(
                        "Invalid object '{}'; expected schema.object",
                        entry
                    ))
                })?;
            objects.insert((schema.to_lowercase(), object.to_lowercase()));
        }
        Ok(Self { objects })
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn matches(&self, change: &Change) -> bool {
        self.objects.is_empty()
            || self.objects.contains(&(
                change.schema().to_lowercase(),
                change.object_name().to_lowercase(),
            ))
    }

    pub fn apply(&self, changes: Vec<Change>) -> Vec<Change> {
        if self.is_empty() {
            return changes;
        }
        changes.into_iter().filter(|c| self.matches(c)).collect()
    }
}

/// Compare `all_sources` with `deployed` under the configured and per-run options.
pub fn plan(
    registry: &ChangeTypeRegistry,
    config: &CairnConfig,
    deployed: Vec<Change>,
    all_sources: &[Change],
    options: &DeployOptions,
) -> Result<Changeset> {
    let filter = ObjectFilter::parse(&options.only)?;
    let deployed = filter.apply(deployed);
    let sources = filter.apply(all_sources.to_vec());

    let selection = options
        .changesets
        .as_ref()
        .unwrap_or(&config.deploy.changesets)
        .selection();
    let changeset_options = ChangesetOptions {
        rollback: options.rollback,
        lenient_hash: options.lenient_hash || config.deploy.lenient_hash,
        selection,
    };

    let enricher = GraphEnricher::new(config.deploy.name_case)
        .with_unresolved_policy(config.deploy.unresolved_dependencies);
    ChangesetCreator::new(registry, enricher, config.deploy.parallel_threads).determine_changeset(
        deployed,
        sources,
        all_sources,
        &changeset_options,
    )
}

/// Run a validated changeset: immediate commands in order, each followed by
/// its audit update, then the audit-only commands.
pub async fn apply(
    changeset: &Changeset,
    ctx: &ExecutionContext<'_>,
    dao: &dyn ChangeAuditDao,
    execution: &DeployExecution,
    report: &mut DeployReport,
) -> Result<()> {
    for command in &changeset.immediate {
        let start = Instant::now();
        tracing::info!(command = %command, "Executing");
        command.execute(ctx).await?;

        let command = ChangeCommand::Execute(command.clone());
        command.mark_audit_table(dao, execution).await?;
        let execution_time_ms = start.elapsed().as_millis() as i32;
        report.total_time_ms += execution_time_ms;
        report.executed.push(DeployDetail {
            changes: command.changes().len(),
            command: command.description(),
            execution_time_ms,
        });
    }

    for audit in &changeset.audits {
        tracing::info!(command = %audit.description(), "Updating audit table");
        let command = ChangeCommand::Audit(audit.clone());
        command.mark_audit_table(dao, execution).await?;
        report.audits.push(command.description());
    }
    Ok(())
}

/// Execute the deploy command.
pub async fn execute(client: &Client, config: &CairnConfig, options: &DeployOptions) -> Result<DeployReport> {
    let table = config.audit_table_name();

    db::acquire_advisory_lock(client, &table, config.deploy.lock_timeout_secs).await?;

    let result = run_deploy(client, config, options).await;

    // Always release the advisory lock
    if let Err(e) = db::release_advisory_lock(client, &table).await {
        tracing::warn!(error = %e, "Failed to release advisory lock");
    }

    match &result {
        Ok(report) => {
            tracing::info!(
                executed = report.executed.len(),
                audits = report.audits.len(),
                deferred = report.deferred,
                dry_run = report.dry_run,
                total_time_ms = report.total_time_ms,
                "Deploy completed"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Deploy failed");
        }
    }

    result
}

async fn run_deploy(client: &Client, config: &CairnConfig, options: &DeployOptions) -> Result<DeployReport> {
    let dao = PgAuditDao::new(client, &config.deploy.audit_schema, &config.deploy.audit_table);
    let deployed = if options.dry_run {
        if dao.audit_table_exists().await? {
            dao.deployed_changes().await?
        } else {
            Vec::new()
        }
    } else {
        dao.create_audit_table().await?;
        dao.deployed_changes().await?
    };
    let deployed = managed_only(deployed, &config.deploy.schemas);

    let registry = ChangeTypeRegistry::postgres();
    let reader = SourceReader::new(&registry, config.deploy.name_case);
    let all_sources = reader.read(&config.deploy.locations, &config.deploy.schemas)?;

    let changeset = plan(&registry, config, deployed, &all_sources, options)?;

    let mut report = DeployReport {
        dry_run: options.dry_run,
        rollback: options.rollback,
        deferred: changeset.deferred.len(),
        ..Default::default()
    };
    for warning in changeset.non_fatal_warnings() {
        tracing::warn!(warning = %warning.description(), "Deploy warning");
        report.warnings.push(warning.description());
    }
    changeset.validate_for_deployment()?;

    if options.dry_run {
        report.executed = changeset
            .immediate
            .iter()
            .map(|c| DeployDetail {
                command: c.description(),
                changes: c.changes().len(),
                execution_time_ms: 0,
            })
            .collect();
        report.audits = changeset.audits.iter().map(|a| a.description()).collect();
        return Ok(report);
    }
    if !changeset.is_deployment_needed() {
        tracing::info!("Environment is up to date");
        return Ok(report);
    }

    let db_user = db::get_current_user(client)
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let db_name = db::get_current_database(client)
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let user = config.deploy.installed_by.as_deref().unwrap_or(&db_user);
    let tokens = build_tokens(&config.tokens, user, &db_name);
    let execution = DeployExecution::new(user, options.rollback, options.reason.as_deref());
    report.execution_id = Some(execution.id.clone());

    let executor = PgSqlExecutor::with_pool(client, config, extra_connections(&changeset, config)).await?;
    let ctx = ExecutionContext {
        executor: &executor,
        registry: &registry,
        tokens: &tokens,
    };
    apply(&changeset, &ctx, &dao, &execution, &mut report).await?;
    Ok(report)
}

/// Only open extra connections when a parallel batch can use them.
fn extra_connections(changeset: &Changeset, config: &CairnConfig) -> usize {
    let widest = changeset
        .immediate
        .iter()
        .filter_map(|c| match &c.action {
            ExecuteAction::ParallelDeploy { changes, threads, .. } => Some(changes.len().min(*threads)),
            _ => None,
        })
        .max()
        .unwrap_or(1);
    widest.min(config.deploy.parallel_threads).saturating_sub(1)
}

/// Deployed changes in schemas this run manages; all of them when no schema list is set.
pub fn managed_only(deployed: Vec<Change>, schemas: &[String]) -> Vec<Change> {
    if schemas.is_empty() {
        return deployed;
    }
    deployed
        .into_iter()
        .filter(|c| schemas.iter().any(|s| s.eq_ignore_ascii_case(c.schema())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditDao;
    use crate::command::tests::RecordingExecutor;
    use std::collections::HashMap;

    fn table(object: &str, name: &str, order: i32, sql: &str) -> Change {
        Change::incremental("app", "TABLE", object, name, order, sql)
    }

    #[test]
    fn test_object_filter() {
        let filter = ObjectFilter::parse(&["App.Orders".to_string()]).unwrap();
        assert!(filter.matches(&table("orders", "init", 0, "")));
        assert!(!filter.matches(&table("customers", "init", 0, "")));
        assert!(ObjectFilter::parse(&["orders".to_string()]).is_err());
        assert!(ObjectFilter::parse(&[".orders".to_string()]).is_err());
        assert!(ObjectFilter::default().matches(&table("anything", "c", 0, "")));
    }

    #[test]
    fn test_plan_only_keeps_other_deployed_objects() {
        let config = CairnConfig::default();
        let registry = ChangeTypeRegistry::postgres();
        let deployed = vec![table("customers", "init", 0, "CREATE TABLE customers (id INT)")];
        let sources = vec![table("orders", "init", 0, "CREATE TABLE orders (id INT)")];

        // customers is missing from source but outside the selection
        let options = DeployOptions {
            only: vec!["app.orders".to_string()],
            ..Default::default()
        };
        let changeset = plan(&registry, &config, deployed, &sources, &options).unwrap();
        assert!(changeset.warnings.is_empty());
        assert_eq!(changeset.immediate.len(), 1);
        assert_eq!(changeset.immediate[0].description(), "Deploy app.orders.init (TABLE)");
    }

    #[test]
    fn test_plan_changeset_override() {
        let config = CairnConfig::default();
        let registry = ChangeTypeRegistry::postgres();
        let sources = vec![
            table("orders", "init", 0, "CREATE TABLE orders (id INT)"),
            table("customers", "init", 0, "CREATE TABLE customers (id INT)").with_changeset("phase2"),
        ];

        let changeset = plan(&registry, &config, Vec::new(), &sources, &DeployOptions::default()).unwrap();
        assert_eq!(changeset.immediate.len(), 1);
        assert_eq!(changeset.deferred.len(), 1);

        let options = DeployOptions {
            changesets: Some(ChangesetsConfig::Named(vec!["phase2".to_string()])),
            ..Default::default()
        };
        let changeset = plan(&registry, &config, Vec::new(), &sources, &options).unwrap();
        assert_eq!(changeset.immediate.len(), 2);
        assert!(changeset.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_apply_executes_then_audits() {
        let config = CairnConfig::default();
        let registry = ChangeTypeRegistry::postgres();
        let sources = vec![
            table("orders", "init", 0, "CREATE TABLE orders (id INT)"),
            Change::rerunnable("app", "VIEW", "v_orders", "CREATE OR REPLACE VIEW v_orders AS SELECT * FROM orders"),
        ];
        let changeset = plan(&registry, &config, Vec::new(), &sources, &DeployOptions::default()).unwrap();

        let executor = RecordingExecutor::default();
        let tokens = HashMap::new();
        let ctx = ExecutionContext {
            executor: &executor,
            registry: &registry,
            tokens: &tokens,
        };
        let dao = InMemoryAuditDao::default();
        let execution = DeployExecution::new("tester", false, None);
        let mut report = DeployReport::default();
        apply(&changeset, &ctx, &dao, &execution, &mut report).await.unwrap();

        assert_eq!(report.executed.len(), 2);
        assert_eq!(report.executed[0].command, "Deploy app.orders.init (TABLE)");
        let statements = executor.statements.lock().unwrap();
        assert!(statements[1].1.starts_with("CREATE OR REPLACE VIEW"));
        drop(statements);
        assert_eq!(dao.deployed_changes().await.unwrap().len(), 2);

        // second run against the recorded state has nothing to do
        let deployed = dao.deployed_changes().await.unwrap();
        let again = plan(&registry, &config, deployed, &sources, &DeployOptions::default()).unwrap();
        assert!(!again.is_deployment_needed());
    }

    #[test]
    fn test_managed_only() {
        let deployed = vec![
            table("orders", "init", 0, ""),
            Change::incremental("other", "TABLE", "t", "c", 0, ""),
        ];
        assert_eq!(managed_only(deployed.clone(), &[]).len(), 2);
        let kept = managed_only(deployed, &["APP".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].schema(), "app");
    }
}
