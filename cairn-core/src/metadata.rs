//! Live-object discovery from the PostgreSQL catalogs, used by the cleaner.

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::change_type::{FOREIGN_KEY, FUNCTION, SEQUENCE, SP, TABLE, USERTYPE, VIEW};
use crate::db::quote_ident;
use crate::error::Result;

/// An object that currently exists in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveObject {
    pub schema: String,
    pub change_type: String,
    /// Object name; for a foreign key, the table it belongs to.
    pub name: String,
    /// Statement that removes the object, when the type's default drop does not fit.
    pub drop_sql: Option<String>,
}

impl LiveObject {
    pub fn new(schema: &str, change_type: &str, name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            change_type: change_type.to_string(),
            name: name.to_string(),
            drop_sql: None,
        }
    }

    pub fn with_drop_sql(mut self, sql: String) -> Self {
        self.drop_sql = Some(sql);
        self
    }
}

/// Lists what exists in an environment.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    async fn live_objects(&self, schema: &str) -> Result<Vec<LiveObject>>;
}

/// Catalog reader for PostgreSQL. Skips the audit table.
pub struct PgMetadataReader<'a> {
    client: &'a Client,
    audit_schema: String,
    audit_table: String,
}

/// Fold overloads of one routine into a single object dropping every signature.
fn merge_overloads(objects: Vec<LiveObject>) -> Vec<LiveObject> {
    let mut merged: Vec<LiveObject> = Vec::with_capacity(objects.len());
    for object in objects {
        match merged
            .iter_mut()
            .find(|o| o.change_type == object.change_type && o.name == object.name)
        {
            Some(existing) => {
                let combined = [existing.drop_sql.take(), object.drop_sql]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(";\n");
                existing.drop_sql = Some(combined);
            }
            None => merged.push(object),
        }
    }
    merged
}

impl<'a> PgMetadataReader<'a> {
    pub fn new(client: &'a Client, audit_schema: &str, audit_table: &str) -> Self {
        Self {
            client,
            audit_schema: audit_schema.to_string(),
            audit_table: audit_table.to_string(),
        }
    }

    async fn names(&self, sql: &str, schema: &str) -> Result<Vec<String>> {
        let rows = self.client.query(sql, &[&schema]).await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

#[async_trait]
impl MetadataReader for PgMetadataReader<'_> {
    async fn live_objects(&self, schema: &str) -> Result<Vec<LiveObject>> {
        let schema_q = quote_ident(schema);
        let mut objects = Vec::new();

        for name in self
            .names("SELECT matviewname FROM pg_matviews WHERE schemaname = $1", schema)
            .await?
        {
            let sql = format!(
                "DROP MATERIALIZED VIEW IF EXISTS {}.{} CASCADE",
                schema_q,
                quote_ident(&name)
            );
            objects.push(LiveObject::new(schema, VIEW, &name).with_drop_sql(sql));
        }

        for name in self
            .names(
                "SELECT table_name FROM information_schema.views WHERE table_schema = $1",
                schema,
            )
            .await?
        {
            objects.push(LiveObject::new(schema, VIEW, &name));
        }

        for name in self
            .names("SELECT tablename FROM pg_tables WHERE schemaname = $1", schema)
            .await?
        {
            if schema == self.audit_schema && name == self.audit_table {
                continue;
            }
            objects.push(LiveObject::new(schema, TABLE, &name));
        }

        let rows = self
            .client
            .query(
                "SELECT rel.relname, con.conname \
                 FROM pg_constraint con \
                 JOIN pg_class rel ON con.conrelid = rel.oid \
                 JOIN pg_namespace n ON rel.relnamespace = n.oid \
                 WHERE n.nspname = $1 AND con.contype = 'f' \
                 ORDER BY rel.relname, con.conname",
                &[&schema],
            )
            .await?;
        for row in rows {
            let table: String = row.get(0);
            let constraint: String = row.get(1);
            let sql = format!(
                "ALTER TABLE {}.{} DROP CONSTRAINT {}",
                schema_q,
                quote_ident(&table),
                quote_ident(&constraint)
            );
            objects.push(LiveObject::new(schema, FOREIGN_KEY, &table).with_drop_sql(sql));
        }

        for name in self
            .names(
                "SELECT sequence_name FROM information_schema.sequences WHERE sequence_schema = $1",
                schema,
            )
            .await?
        {
            objects.push(LiveObject::new(schema, SEQUENCE, &name));
        }

        let rows = self
            .client
            .query(
                "SELECT p.proname, pg_get_function_identity_arguments(p.oid) as args, p.prokind::text \
                 FROM pg_proc p \
                 JOIN pg_namespace n ON p.pronamespace = n.oid \
                 WHERE n.nspname = $1 AND p.prokind IN ('f', 'p') \
                 ORDER BY p.proname, args",
                &[&schema],
            )
            .await?;
        let mut routines = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let args: String = row.get(1);
            let kind: String = row.get(2);
            let (change_type, keyword) = if kind == "p" {
                (SP, "PROCEDURE")
            } else {
                (FUNCTION, "FUNCTION")
            };
            let sql = format!(
                "DROP {} IF EXISTS {}.{}({}) CASCADE",
                keyword,
                schema_q,
                quote_ident(&name),
                args
            );
            routines.push(LiveObject::new(schema, change_type, &name).with_drop_sql(sql));
        }
        objects.extend(merge_overloads(routines));

        // Enums and standalone composite types; table row types are excluded.
        for name in self
            .names(
                "SELECT t.typname \
                 FROM pg_type t \
                 JOIN pg_namespace n ON t.typnamespace = n.oid \
                 LEFT JOIN pg_class c ON c.oid = t.typrelid \
                 WHERE n.nspname = $1 \
                 AND t.typtype IN ('e', 'c') \
                 AND (t.typrelid = 0 OR c.relkind = 'c') \
                 AND t.typname NOT LIKE '\\_%'",
                schema,
            )
            .await?
        {
            objects.push(LiveObject::new(schema, USERTYPE, &name));
        }

        tracing::debug!(schema = %schema, objects = objects.len(), "Read live objects");
        Ok(objects)
    }
}
