use serde::Serialize;
use tokio_postgres::Client;

use crate::audit::ChangeAuditDao;
use crate::change_type::ChangeTypeRegistry;
use crate::changeset::Changeset;
use crate::config::CairnConfig;
use crate::error::{CairnError, Result};
use crate::history::PgAuditDao;
use crate::reader::SourceReader;

use super::deploy::{managed_only, plan, DeployOptions};

/// Report returned after a validate operation.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidateReport {
    pub fn from_changeset(changeset: &Changeset) -> Self {
        let issues: Vec<String> = changeset.fatal_warnings().map(|w| w.description()).collect();
        let warnings = changeset.non_fatal_warnings().map(|w| w.description()).collect();
        Self {
            valid: issues.is_empty(),
            issues,
            warnings,
        }
    }
}

/// Execute the validate command.
///
/// Compares source with the audit table and reports every warning the
/// next deploy would raise. Fails if any of them blocks deployment.
pub async fn execute(client: &Client, config: &CairnConfig) -> Result<ValidateReport> {
    let dao = PgAuditDao::new(client, &config.deploy.audit_schema, &config.deploy.audit_table);

    let registry = ChangeTypeRegistry::postgres();
    let sources = SourceReader::new(&registry, config.deploy.name_case)
        .read(&config.deploy.locations, &config.deploy.schemas)?;

    if !dao.audit_table_exists().await? {
        return Ok(ValidateReport {
            valid: true,
            issues: Vec::new(),
            warnings: vec!["No audit table found; nothing is deployed yet.".to_string()],
        });
    }

    let deployed = managed_only(dao.deployed_changes().await?, &config.deploy.schemas);
    let changeset = plan(&registry, config, deployed, &sources, &DeployOptions::default())?;
    let report = ValidateReport::from_changeset(&changeset);

    tracing::info!(
        valid = report.valid,
        issue_count = report.issues.len(),
        warning_count = report.warnings.len(),
        "Validation completed"
    );

    if !report.valid {
        return Err(CairnError::FatalWarningsError(report.issues.join("\n")));
    }

    Ok(report)
}
