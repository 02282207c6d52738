//! PostgreSQL-backed audit table of deployed changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::audit::{ChangeAuditDao, DeployExecution};
use crate::change::Change;
use crate::db::quote_ident;
use crate::error::Result;

const COLUMNS: &str = "schema_name, change_type, object_name, change_name, content_hash, \
     rollback_content, active, incremental, order_within_object, changeset, \
     deploy_user, execution_id, time_inserted, time_updated, drop_content";

/// Audit store in the `<schema>.<table>` audit table.
pub struct PgAuditDao<'a> {
    client: &'a Client,
    schema: String,
    table: String,
}

impl<'a> PgAuditDao<'a> {
    pub fn new(client: &'a Client, schema: &str, table: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Create the audit table if it does not exist.
    pub async fn create_audit_table(&self) -> Result<()> {
        let idx_name = format!("{}_exec_idx", self.table);
        let sql = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {fq} (
    schema_name         VARCHAR(128) NOT NULL,
    change_type         VARCHAR(64) NOT NULL,
    object_name         VARCHAR(256) NOT NULL,
    change_name         VARCHAR(256) NOT NULL,
    content_hash        VARCHAR(64) NOT NULL,
    rollback_content    TEXT,
    drop_content        TEXT,
    active              BOOLEAN NOT NULL DEFAULT TRUE,
    incremental         BOOLEAN NOT NULL,
    order_within_object INTEGER NOT NULL DEFAULT 0,
    changeset           VARCHAR(128),
    deploy_user         VARCHAR(128) NOT NULL,
    execution_id        VARCHAR(64) NOT NULL,
    time_inserted       TIMESTAMPTZ NOT NULL DEFAULT now(),
    time_updated        TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (schema_name, change_type, object_name, change_name)
);

ALTER TABLE {fq} ADD COLUMN IF NOT EXISTS drop_content TEXT;

CREATE INDEX IF NOT EXISTS {idx_name} ON {fq} (execution_id);
"#,
            schema = quote_ident(&self.schema),
            fq = self.qualified(),
            idx_name = quote_ident(&idx_name),
        );

        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    /// Check if the audit table exists.
    pub async fn audit_table_exists(&self) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema, &self.table],
            )
            .await?;

        Ok(row.get::<_, bool>(0))
    }

    /// Forget every change recorded for `schema`. Used after cleaning it.
    pub async fn delete_schema_changes(&self, schema: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE schema_name = $1", self.qualified());
        let count = self.client.execute(&sql, &[&schema]).await?;
        Ok(count)
    }

    async fn write(&self, change: &Change, execution: &DeployExecution, upsert: bool) -> Result<()> {
        let conflict = if upsert {
            " ON CONFLICT (schema_name, change_type, object_name, change_name) DO UPDATE SET \
             content_hash = EXCLUDED.content_hash, rollback_content = EXCLUDED.rollback_content, \
             drop_content = EXCLUDED.drop_content, \
             active = EXCLUDED.active, changeset = EXCLUDED.changeset, \
             deploy_user = EXCLUDED.deploy_user, execution_id = EXCLUDED.execution_id, \
             time_updated = EXCLUDED.time_updated"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, $14){}",
            self.qualified(),
            COLUMNS,
            conflict
        );

        let incremental = !change.is_rerunnable();
        let order_within_object = change.order_within_object();
        self.client
            .execute(
                &sql,
                &[
                    &change.schema(),
                    &change.change_type(),
                    &change.object_name(),
                    &change.change_name(),
                    &change.content_hash,
                    &change.rollback_content,
                    &change.active,
                    &incremental,
                    &order_within_object,
                    &change.changeset,
                    &execution.user,
                    &execution.id,
                    &execution.started_at,
                    &change.drop_content,
                ],
            )
            .await?;
        Ok(())
    }
}

fn change_from_row(row: &Row) -> Change {
    let schema: String = row.get(0);
    let change_type: String = row.get(1);
    let object_name: String = row.get(2);
    let change_name: String = row.get(3);
    let content_hash: String = row.get(4);
    let incremental: bool = row.get(7);

    let mut change = if incremental {
        Change::incremental(&schema, &change_type, &object_name, &change_name, row.get(8), "")
    } else {
        Change::rerunnable(&schema, &change_type, &object_name, "")
    };
    change.content_hash = content_hash;
    change.rollback_content = row.get(5);
    change.active = row.get(6);
    change.changeset = row.get(9);
    change.time_inserted = Some(row.get::<_, DateTime<Utc>>(12));
    change.time_updated = Some(row.get::<_, DateTime<Utc>>(13));
    change.drop_content = row.get(14);
    change
}

#[async_trait]
impl ChangeAuditDao for PgAuditDao<'_> {
    async fn deployed_changes(&self) -> Result<Vec<Change>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY schema_name, change_type, object_name, order_within_object, change_name",
            COLUMNS,
            self.qualified()
        );
        let rows = self.client.query(&sql, &[]).await?;
        Ok(rows.iter().map(change_from_row).collect())
    }

    async fn insert_new_change(&self, change: &Change, execution: &DeployExecution) -> Result<()> {
        self.write(change, execution, false).await
    }

    async fn update_or_insert_change(&self, change: &Change, execution: &DeployExecution) -> Result<()> {
        self.write(change, execution, true).await
    }

    async fn delete_change(&self, change: &Change) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE schema_name = $1 AND change_type = $2 AND object_name = $3 AND change_name = $4",
            self.qualified()
        );
        self.client
            .execute(
                &sql,
                &[
                    &change.schema(),
                    &change.change_type(),
                    &change.object_name(),
                    &change.change_name(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_object_changes(&self, change: &Change) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE schema_name = $1 AND change_type = $2 AND object_name = $3",
            self.qualified()
        );
        self.client
            .execute(&sql, &[&change.schema(), &change.change_type(), &change.object_name()])
            .await?;
        Ok(())
    }
}
