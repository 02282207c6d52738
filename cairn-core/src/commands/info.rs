use serde::Serialize;
use tokio_postgres::Client;

use crate::audit::ChangeAuditDao;
use crate::change::Change;
use crate::change_type::ChangeTypeRegistry;
use crate::changeset::Changeset;
use crate::config::CairnConfig;
use crate::error::Result;
use crate::history::PgAuditDao;
use crate::reader::SourceReader;

use super::deploy::{managed_only, plan, DeployOptions};

/// Where a planned command ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanBucket {
    /// Runs on the next deploy.
    Immediate,
    /// Held back by the changeset selection.
    Deferred,
    /// Updates the audit table only.
    Audit,
    Warning,
    /// A warning that blocks deployment.
    Fatal,
}

impl std::fmt::Display for PlanBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanBucket::Immediate => write!(f, "Immediate"),
            PlanBucket::Deferred => write!(f, "Deferred"),
            PlanBucket::Audit => write!(f, "Audit Only"),
            PlanBucket::Warning => write!(f, "Warning"),
            PlanBucket::Fatal => write!(f, "Fatal"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedCommand {
    /// 1-based position within the bucket's execution order.
    pub position: usize,
    pub bucket: PlanBucket,
    pub description: String,
    pub objects: Vec<String>,
}

/// Every command the next deploy would produce, without running any of them.
#[derive(Debug, Default, Serialize)]
pub struct PlanReport {
    pub source_changes: usize,
    pub deployed_changes: usize,
    pub commands: Vec<PlannedCommand>,
}

impl PlanReport {
    pub fn count(&self, bucket: PlanBucket) -> usize {
        self.commands.iter().filter(|c| c.bucket == bucket).count()
    }
}

fn object_names<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Vec<String> {
    let mut names: Vec<String> = changes.into_iter().map(|c| c.object_key().to_string()).collect();
    names.dedup();
    names
}

/// Flatten a changeset into report rows, bucket by bucket.
pub fn plan_report(changeset: &Changeset, source_changes: usize, deployed_changes: usize) -> PlanReport {
    let mut commands = Vec::new();
    let mut push = |bucket: PlanBucket, position: usize, description: String, objects: Vec<String>| {
        commands.push(PlannedCommand {
            position: position + 1,
            bucket,
            description,
            objects,
        });
    };

    for (i, cmd) in changeset.immediate.iter().enumerate() {
        push(PlanBucket::Immediate, i, cmd.description(), object_names(cmd.changes()));
    }
    for (i, cmd) in changeset.deferred.iter().enumerate() {
        push(PlanBucket::Deferred, i, cmd.description(), object_names(cmd.changes()));
    }
    for (i, cmd) in changeset.audits.iter().enumerate() {
        push(PlanBucket::Audit, i, cmd.description(), object_names(cmd.changes()));
    }
    for (i, warning) in changeset.warnings.iter().enumerate() {
        let bucket = if warning.is_fatal() {
            PlanBucket::Fatal
        } else {
            PlanBucket::Warning
        };
        push(bucket, i, warning.description(), object_names(&warning.changes));
    }

    PlanReport {
        source_changes,
        deployed_changes,
        commands,
    }
}

/// Execute the info command: plan a default deploy and report it.
pub async fn execute(client: &Client, config: &CairnConfig) -> Result<PlanReport> {
    let dao = PgAuditDao::new(client, &config.deploy.audit_schema, &config.deploy.audit_table);

    // No audit table yet means nothing is deployed
    let deployed = if dao.audit_table_exists().await? {
        managed_only(dao.deployed_changes().await?, &config.deploy.schemas)
    } else {
        Vec::new()
    };
    let deployed_count = deployed.len();

    let registry = ChangeTypeRegistry::postgres();
    let sources = SourceReader::new(&registry, config.deploy.name_case)
        .read(&config.deploy.locations, &config.deploy.schemas)?;

    let changeset = plan(&registry, config, deployed, &sources, &DeployOptions::default())?;
    let report = plan_report(&changeset, sources.len(), deployed_count);

    tracing::info!(
        immediate = report.count(PlanBucket::Immediate),
        deferred = report.count(PlanBucket::Deferred),
        audits = report.count(PlanBucket::Audit),
        "Plan computed"
    );
    Ok(report)
}
