//! Integration tests for cairn-core against PostgreSQL.
//!
//! Skipped unless TEST_DATABASE_URL is set, e.g.:
//!   TEST_DATABASE_URL="host=localhost user=postgres dbname=cairn_test"
//!
//! Run with: cargo test --test integration_test

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_core::audit::ChangeAuditDao;
use cairn_core::config::{CairnConfig, DatabaseConfig};
use cairn_core::db::{self, quote_ident};
use cairn_core::error::CairnError;
use cairn_core::history::PgAuditDao;
use cairn_core::{Cairn, ConfirmFn, DeployOptions, PlanBucket};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn get_test_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Build a config managing one unique schema, with the audit table inside it.
fn test_config(url: &str, schema: &str, source_dir: &Path) -> CairnConfig {
    let mut config = CairnConfig {
        database: DatabaseConfig {
            url: Some(url.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    config.deploy.locations = vec![source_dir.to_path_buf()];
    config.deploy.schemas = vec![schema.to_string()];
    config.deploy.audit_schema = schema.to_string();
    config.deploy.lock_timeout_secs = 5;
    config
}

/// Helper: connect, create a fresh schema, return client + schema name.
async fn setup_schema(url: &str, prefix: &str) -> (tokio_postgres::Client, String) {
    let client = db::connect(url).await.expect("Failed to connect to DB");

    // Use a unique schema name per test to avoid collisions
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let schema = format!("cairn_test_{}_{}_{}", prefix, std::process::id(), id);

    client
        .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema)))
        .await
        .expect("Failed to create test schema");

    (client, schema)
}

/// Helper: drop the test schema.
async fn teardown_schema(client: &tokio_postgres::Client, schema: &str) {
    let _ = client
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
        .await;
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// customers, orders with a foreign key to customers, and a view over both.
fn write_sources(root: &Path, schema: &str) {
    write(
        root,
        &format!("{}/table/customers.sql", schema),
        "//// CHANGE name=init\nCREATE TABLE customers (id INT PRIMARY KEY, name TEXT)\n",
    );
    write(
        root,
        &format!("{}/table/orders.sql", schema),
        "//// CHANGE name=init\n\
         CREATE TABLE orders (id INT PRIMARY KEY, customer_id INT)\n\
         //// CHANGE FK name=fk_customer\n\
         ALTER TABLE orders ADD CONSTRAINT fk_customer FOREIGN KEY (customer_id) REFERENCES customers (id)\n",
    );
    write(
        root,
        &format!("{}/view/v_orders.sql", schema),
        "CREATE OR REPLACE VIEW v_orders AS SELECT o.id, c.name FROM orders o JOIN customers c ON c.id = o.customer_id",
    );
}

async fn table_exists(client: &tokio_postgres::Client, schema: &str, table: &str) -> bool {
    client
        .query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
            &[&schema, &table],
        )
        .await
        .unwrap()
        .get(0)
}

#[tokio::test]
async fn test_deploy_creates_objects_and_audit_rows() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "deploy").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    let report = cairn.deploy(&DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 4);
    assert!(report.execution_id.is_some());

    assert!(table_exists(&client, &schema, "customers").await);
    assert!(table_exists(&client, &schema, "orders").await);
    let views: i64 = client
        .query_one(
            "SELECT count(*) FROM information_schema.views WHERE table_schema = $1",
            &[&schema],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(views, 1);

    let dao = PgAuditDao::new(&client, &schema, "cairn_audit");
    let deployed = dao.deployed_changes().await.unwrap();
    assert_eq!(deployed.len(), 4);
    assert!(deployed.iter().all(|c| c.time_inserted.is_some()));

    // Nothing left to do
    let again = cairn.deploy(&DeployOptions::default()).await.unwrap();
    assert!(again.executed.is_empty());
    let plan = cairn.info().await.unwrap();
    assert_eq!(plan.count(PlanBucket::Immediate), 0);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_info_and_dry_run_change_nothing() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "info").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    let plan = cairn.info().await.unwrap();
    assert_eq!(plan.count(PlanBucket::Immediate), 4);
    assert_eq!(plan.deployed_changes, 0);

    let dry_run = DeployOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = cairn.deploy(&dry_run).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.executed.len(), 4);
    assert!(!table_exists(&client, &schema, "customers").await);
    assert!(!table_exists(&client, &schema, "cairn_audit").await);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_validate_detects_edited_change() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "validate").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    cairn.deploy(&DeployOptions::default()).await.unwrap();
    assert!(cairn.validate().await.unwrap().valid);

    write(
        source.path(),
        &format!("{}/table/customers.sql", schema),
        "//// CHANGE name=init\nCREATE TABLE customers (id BIGINT PRIMARY KEY, name TEXT)\n",
    );
    let result = cairn.validate().await;
    assert!(matches!(result, Err(CairnError::FatalWarningsError(_))));
    let result = cairn.deploy(&DeployOptions::default()).await;
    assert!(matches!(result, Err(CairnError::FatalWarningsError(_))));

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_recorded_drop_command_survives_source_removal() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "dropcmd").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);
    write(
        source.path(),
        &format!("{}/function/f_total.sql", schema),
        "CREATE OR REPLACE FUNCTION f_total(n int) RETURNS int LANGUAGE sql AS $$ SELECT n $$\n\
         //// DROP_COMMAND\n\
         DROP FUNCTION f_total(int)\n",
    );

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    cairn.deploy(&DeployOptions::default()).await.unwrap();

    let dao = PgAuditDao::new(&client, &schema, "cairn_audit");
    let deployed = dao.deployed_changes().await.unwrap();
    let function = deployed.iter().find(|c| c.object_name() == "f_total").unwrap();
    assert_eq!(function.drop_content.as_deref(), Some("DROP FUNCTION f_total(int)"));

    // an overload outside cairn's control makes the generic drop ambiguous
    client
        .batch_execute(&format!(
            "CREATE FUNCTION {}.f_total(s text) RETURNS text LANGUAGE sql AS $$ SELECT s $$",
            quote_ident(&schema)
        ))
        .await
        .unwrap();

    std::fs::remove_file(source.path().join(format!("{}/function/f_total.sql", schema))).unwrap();
    let report = cairn.deploy(&DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 1);

    let remaining: Vec<String> = client
        .query(
            "SELECT pg_get_function_identity_arguments(p.oid) FROM pg_proc p \
             JOIN pg_namespace n ON n.oid = p.pronamespace WHERE n.nspname = $1 AND p.proname = 'f_total'",
            &[&schema],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect();
    assert_eq!(remaining, vec!["s text".to_string()]);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_failed_command_keeps_earlier_audit_rows() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "failure").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);
    write(
        source.path(),
        &format!("{}/sp/sp_broken.sql", schema),
        "CREATE PROCEDURE sp_broken() LANGUAGE sql AS $$ SELECT * FROM no_such_table $$",
    );

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    let result = cairn.deploy(&DeployOptions::default()).await;
    assert!(matches!(result, Err(CairnError::CommandFailed { .. })));

    // tables deploy before procedures and stay recorded
    let dao = PgAuditDao::new(&client, &schema, "cairn_audit");
    let deployed = dao.deployed_changes().await.unwrap();
    assert!(deployed.iter().any(|c| c.object_name() == "customers"));
    assert!(deployed.iter().all(|c| c.object_name() != "sp_broken"));

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_clean_drops_everything_but_audit_table() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "clean").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let mut config = test_config(&url, &schema, source.path());
    let cairn = Cairn::new(config.clone()).await.unwrap();
    cairn.deploy(&DeployOptions::default()).await.unwrap();

    let result = cairn.clean(false, None).await;
    assert!(matches!(result, Err(CairnError::CleanDisabled)));

    config.deploy.clean_enabled = true;
    let cairn = Cairn::new(config).await.unwrap();
    let report = cairn.clean(false, None).await.unwrap();
    assert!(!report.dropped.is_empty());
    assert!(!table_exists(&client, &schema, "orders").await);
    assert!(!table_exists(&client, &schema, "customers").await);
    assert!(table_exists(&client, &schema, "cairn_audit").await);

    let dao = PgAuditDao::new(&client, &schema, "cairn_audit");
    assert!(dao.deployed_changes().await.unwrap().is_empty());

    // a clean environment redeploys from scratch
    let report = cairn.deploy(&DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 4);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_clean_can_be_declined() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "decline").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let cairn = Cairn::new(test_config(&url, &schema, source.path())).await.unwrap();
    cairn.deploy(&DeployOptions::default()).await.unwrap();

    let decline = |_: &[cairn_core::command::ExecuteCommand]| false;
    let confirm: ConfirmFn<'_> = &decline;
    let result = cairn.clean(true, Some(confirm)).await;
    assert!(matches!(result, Err(CairnError::CleanAbortedError)));
    assert!(table_exists(&client, &schema, "orders").await);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_deploy_fails_while_lock_is_held() {
    let Some(url) = get_test_url() else { return };
    let (client, schema) = setup_schema(&url, "lock").await;
    let source = tempfile::tempdir().unwrap();
    write_sources(source.path(), &schema);

    let mut config = test_config(&url, &schema, source.path());
    config.deploy.lock_timeout_secs = 0;
    db::acquire_advisory_lock(&client, &config.audit_table_name(), 0).await.unwrap();

    let cairn = Cairn::new(config.clone()).await.unwrap();
    let result = cairn.deploy(&DeployOptions::default()).await;
    assert!(matches!(result, Err(CairnError::LockError(_))));

    db::release_advisory_lock(&client, &config.audit_table_name()).await.unwrap();
    assert!(cairn.deploy(&DeployOptions::default()).await.is_ok());

    teardown_schema(&client, &schema).await;
}
