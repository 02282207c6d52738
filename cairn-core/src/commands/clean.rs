//! Drop every object in the managed schemas (destructive).

use std::collections::BTreeSet;

use tokio_postgres::Client;

use crate::change_type::ChangeTypeRegistry;
use crate::cleaner::{CleanReport, ConfirmFn, EnvironmentCleaner};
use crate::config::CairnConfig;
use crate::db::{self, PgSqlExecutor};
use crate::error::{CairnError, Result};
use crate::graph::enricher::GraphEnricher;
use crate::history::PgAuditDao;
use crate::metadata::PgMetadataReader;
use crate::reader::SourceReader;
use crate::tokens::build_tokens;

/// Schemas to clean: the configured list, or every schema found in source.
fn target_schemas(config: &CairnConfig, registry: &ChangeTypeRegistry) -> Result<Vec<String>> {
    if !config.deploy.schemas.is_empty() {
        return Ok(config.deploy.schemas.clone());
    }
    let sources = SourceReader::new(registry, config.deploy.name_case).read(&config.deploy.locations, &[])?;
    let schemas: BTreeSet<String> = sources.iter().map(|c| c.schema().to_string()).collect();
    Ok(schemas.into_iter().collect())
}

/// Execute the clean command.
///
/// Requires clean_enabled=true or allow_clean=true. `confirm` sees the
/// first drop plan and can abort before anything is dropped.
pub async fn execute(
    client: &Client,
    config: &CairnConfig,
    allow_clean: bool,
    confirm: Option<ConfirmFn<'_>>,
) -> Result<CleanReport> {
    if !config.deploy.clean_enabled && !allow_clean {
        return Err(CairnError::CleanDisabled);
    }

    let table = config.audit_table_name();
    db::acquire_advisory_lock(client, &table, config.deploy.lock_timeout_secs).await?;

    let result = run_clean(client, config, confirm).await;

    if let Err(e) = db::release_advisory_lock(client, &table).await {
        tracing::warn!(error = %e, "Failed to release advisory lock");
    }
    result
}

async fn run_clean(client: &Client, config: &CairnConfig, confirm: Option<ConfirmFn<'_>>) -> Result<CleanReport> {
    let registry = ChangeTypeRegistry::postgres();
    let schemas = target_schemas(config, &registry)?;
    if schemas.is_empty() {
        tracing::info!("No schemas to clean");
        return Ok(CleanReport::default());
    }

    tracing::warn!(schemas = %schemas.join(", "), "Starting clean; this will DROP all objects in these schemas");

    let db_user = db::get_current_user(client)
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let db_name = db::get_current_database(client)
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let tokens = build_tokens(&config.tokens, &db_user, &db_name);

    let reader = PgMetadataReader::new(client, &config.deploy.audit_schema, &config.deploy.audit_table);
    let executor = PgSqlExecutor::single(client);
    let enricher = GraphEnricher::new(config.deploy.name_case);
    let cleaner = EnvironmentCleaner::new(&registry, enricher, &reader, &executor, &tokens);
    let report = cleaner.clean(&schemas, confirm).await?;

    let dao = PgAuditDao::new(client, &config.deploy.audit_schema, &config.deploy.audit_table);
    if dao.audit_table_exists().await? {
        for schema in &schemas {
            let forgotten = dao.delete_schema_changes(schema).await?;
            tracing::debug!(schema = %schema, forgotten, "Cleared audit records");
        }
    }

    tracing::warn!(
        schemas = %schemas.join(", "),
        objects_dropped = report.dropped.len(),
        passes = report.passes,
        "Clean completed"
    );
    Ok(report)
}
