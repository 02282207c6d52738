//! End-to-end deploy tests that need no database.
//!
//! Source trees live in temp directories; the audit store is in memory and
//! SQL is recorded instead of executed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use cairn_core::audit::{ChangeAuditDao, DeployExecution, InMemoryAuditDao};
use cairn_core::change_type::ChangeTypeRegistry;
use cairn_core::command::{ExecutionContext, SqlExecutor};
use cairn_core::commands::deploy::{apply, plan, DeployOptions, DeployReport};
use cairn_core::config::{CairnConfig, ChangesetsConfig};
use cairn_core::error::{CairnError, Result};
use cairn_core::reader::SourceReader;
use cairn_core::tokens::build_tokens;

#[derive(Default)]
struct Recorder {
    statements: Mutex<Vec<String>>,
}

#[async_trait]
impl SqlExecutor for Recorder {
    async fn execute(&self, _schema: &str, sql: &str) -> Result<()> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(())
    }
}

const CUSTOMERS: &str = "\
//// CHANGE name=init
CREATE TABLE customers (id INT PRIMARY KEY)
";

const ORDERS: &str = "\
//// CHANGE name=init
CREATE TABLE orders (id INT PRIMARY KEY, customer_id INT)
//// CHANGE FK name=fk_customer
ALTER TABLE orders ADD CONSTRAINT fk_customer FOREIGN KEY (customer_id) REFERENCES customers (id)
";

const V_ORDERS: &str =
    "CREATE OR REPLACE VIEW ${cairn:schema}.v_orders AS SELECT o.id FROM orders o JOIN customers c ON c.id = o.customer_id";

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn source_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "app/table/customers.sql", CUSTOMERS);
    write(dir.path(), "app/table/orders.sql", ORDERS);
    write(dir.path(), "app/view/v_orders.sql", V_ORDERS);
    dir
}

fn config_for(root: &Path) -> CairnConfig {
    let mut config = CairnConfig::default();
    config.deploy.locations = vec![root.to_path_buf()];
    config.deploy.schemas = vec!["app".to_string()];
    config
}

/// Read, plan, validate and apply one deploy; returns the report and executed SQL.
async fn deploy(root: &Path, dao: &InMemoryAuditDao, options: &DeployOptions) -> Result<(DeployReport, Vec<String>)> {
    let config = config_for(root);
    let registry = ChangeTypeRegistry::postgres();
    let sources = SourceReader::new(&registry, config.deploy.name_case)
        .read(&config.deploy.locations, &config.deploy.schemas)?;

    let changeset = plan(&registry, &config, dao.deployed_changes().await?, &sources, options)?;
    changeset.validate_for_deployment()?;

    let recorder = Recorder::default();
    let tokens = build_tokens(&HashMap::new(), "deployer", "appdb");
    let ctx = ExecutionContext {
        executor: &recorder,
        registry: &registry,
        tokens: &tokens,
    };
    let execution = DeployExecution::new("deployer", options.rollback, None);
    let mut report = DeployReport {
        deferred: changeset.deferred.len(),
        ..Default::default()
    };
    apply(&changeset, &ctx, dao, &execution, &mut report).await?;

    let statements = recorder.statements.into_inner().unwrap();
    Ok((report, statements))
}

fn position(commands: &[String], needle: &str) -> usize {
    commands
        .iter()
        .position(|c| c.contains(needle))
        .unwrap_or_else(|| panic!("no command containing '{}' in {:?}", needle, commands))
}

#[tokio::test]
async fn test_first_deploy_follows_dependencies_and_is_idempotent() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();

    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    let commands: Vec<String> = report.executed.iter().map(|d| d.command.clone()).collect();
    assert_eq!(commands.len(), 4);

    let customers = position(&commands, "app.customers.init");
    let orders = position(&commands, "app.orders.init");
    let fk = position(&commands, "app.orders.fk_customer");
    let view = position(&commands, "app.v_orders");
    assert!(customers < fk);
    assert!(orders < fk);
    assert!(customers < view && orders < view);

    // tokens are rendered per schema
    assert!(statements.iter().any(|s| s.starts_with("CREATE OR REPLACE VIEW app.v_orders")));
    assert_eq!(dao.deployed_changes().await.unwrap().len(), 4);

    let (again, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert!(again.executed.is_empty());
    assert!(again.audits.is_empty());
    assert!(statements.is_empty());
}

#[tokio::test]
async fn test_new_incremental_change_deploys_alone() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();

    let extended = format!("{}//// CHANGE name=add_email\nALTER TABLE customers ADD email TEXT\n", CUSTOMERS);
    write(tree.path(), "app/table/customers.sql", &extended);

    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert_eq!(statements, vec!["ALTER TABLE customers ADD email TEXT".to_string()]);
    assert_eq!(report.executed[0].command, "Deploy app.customers.add_email (TABLE)");
    assert_eq!(dao.deployed_changes().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_edited_deployed_change_blocks_deploy() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();

    write(
        tree.path(),
        "app/table/customers.sql",
        "//// CHANGE name=init\nCREATE TABLE customers (id BIGINT PRIMARY KEY)\n",
    );
    let result = deploy(tree.path(), &dao, &DeployOptions::default()).await;
    match result {
        Err(CairnError::FatalWarningsError(text)) => assert!(text.contains("app.customers.init (TABLE)")),
        other => panic!("expected fatal warnings, got {:?}", other.map(|(r, _)| r)),
    }

    // lenient mode accepts the edit without running it
    let lenient = DeployOptions {
        lenient_hash: true,
        ..Default::default()
    };
    let (report, statements) = deploy(tree.path(), &dao, &lenient).await.unwrap();
    assert!(statements.is_empty());
    assert_eq!(report.audits.len(), 1);
    let (report, _) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert!(report.executed.is_empty() && report.audits.is_empty());
}

#[tokio::test]
async fn test_rerunnable_edit_and_removal() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();

    write(
        tree.path(),
        "app/view/v_orders.sql",
        "CREATE OR REPLACE VIEW v_orders AS SELECT o.id, o.customer_id FROM orders o JOIN customers c ON c.id = o.customer_id",
    );
    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 1);
    assert!(statements[0].contains("o.customer_id FROM orders"));

    std::fs::remove_file(tree.path().join("app/view/v_orders.sql")).unwrap();
    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 1);
    assert_eq!(statements, vec!["DROP VIEW IF EXISTS \"app\".\"v_orders\" CASCADE".to_string()]);
    assert!(dao
        .deployed_changes()
        .await
        .unwrap()
        .iter()
        .all(|c| c.object_name() != "v_orders"));
}

#[tokio::test]
async fn test_removed_static_data_file_is_unmanaged() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    write(tree.path(), "app/staticdata/codes.sql", "INSERT INTO codes (id) VALUES (1)");
    deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert!(dao.deployed_changes().await.unwrap().iter().any(|c| c.object_name() == "codes"));

    std::fs::remove_file(tree.path().join("app/staticdata/codes.sql")).unwrap();
    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert!(statements.is_empty());
    assert!(report.executed.is_empty());
    assert_eq!(report.audits.len(), 1);
    assert!(dao
        .deployed_changes()
        .await
        .unwrap()
        .iter()
        .all(|c| c.object_name() != "codes"));

    // later deploys are not blocked by the removed object
    let (report, statements) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert!(statements.is_empty());
    assert!(report.executed.is_empty() && report.audits.is_empty());
}

#[tokio::test]
async fn test_removed_change_needs_rollback_mode() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    let with_extra = format!(
        "{}//// CHANGE name=add_email\nALTER TABLE customers ADD email TEXT\n// ROLLBACK\nALTER TABLE customers DROP email\n",
        CUSTOMERS
    );
    write(tree.path(), "app/table/customers.sql", &with_extra);
    deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();

    write(tree.path(), "app/table/customers.sql", CUSTOMERS);
    let result = deploy(tree.path(), &dao, &DeployOptions::default()).await;
    assert!(matches!(result, Err(CairnError::FatalWarningsError(_))));

    let rollback = DeployOptions {
        rollback: true,
        ..Default::default()
    };
    let (_, statements) = deploy(tree.path(), &dao, &rollback).await.unwrap();
    assert_eq!(statements, vec!["ALTER TABLE customers DROP email".to_string()]);
    assert!(dao
        .deployed_changes()
        .await
        .unwrap()
        .iter()
        .all(|c| c.change_name() != "add_email"));
}

#[tokio::test]
async fn test_tagged_changes_wait_for_their_changeset() {
    let tree = source_tree();
    let dao = InMemoryAuditDao::default();
    write(
        tree.path(),
        "app/table/invoices.sql",
        "//// CHANGE name=init changeset=phase2\nCREATE TABLE invoices (id INT)\n",
    );

    let (report, _) = deploy(tree.path(), &dao, &DeployOptions::default()).await.unwrap();
    assert_eq!(report.executed.len(), 4);
    assert_eq!(report.deferred, 1);

    let all = DeployOptions {
        changesets: Some(ChangesetsConfig::All),
        ..Default::default()
    };
    let (report, statements) = deploy(tree.path(), &dao, &all).await.unwrap();
    assert_eq!(report.deferred, 0);
    assert_eq!(statements, vec!["CREATE TABLE invoices (id INT)".to_string()]);
}
