//! Audit-store contract and the per-run execution record.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::change::{Change, ChangeKey};
use crate::error::Result;

/// Identifies one deploy or clean run in the audit table.
#[derive(Debug, Clone, Serialize)]
pub struct DeployExecution {
    pub id: String,
    pub user: String,
    pub tool_version: String,
    pub started_at: DateTime<Utc>,
    pub rollback: bool,
    pub reason: Option<String>,
}

impl DeployExecution {
    pub fn new(user: &str, rollback: bool, reason: Option<&str>) -> Self {
        let started_at = Utc::now();
        Self {
            id: format!(
                "{}-{:06}",
                started_at.format("%Y%m%d%H%M%S"),
                fastrand::u32(0..1_000_000)
            ),
            user: user.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            rollback,
            reason: reason.map(str::to_string),
        }
    }
}

/// Persistent record of which changes are deployed to an environment.
#[async_trait]
pub trait ChangeAuditDao: Send + Sync {
    /// Every change recorded as deployed.
    async fn deployed_changes(&self) -> Result<Vec<Change>>;

    async fn insert_new_change(&self, change: &Change, execution: &DeployExecution) -> Result<()>;

    async fn update_or_insert_change(&self, change: &Change, execution: &DeployExecution) -> Result<()>;

    async fn delete_change(&self, change: &Change) -> Result<()>;

    /// Remove every change recorded for the object `change` belongs to.
    async fn delete_object_changes(&self, change: &Change) -> Result<()>;
}

/// Audit store kept in process memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryAuditDao {
    changes: Mutex<BTreeMap<ChangeKey, Change>>,
}

impl InMemoryAuditDao {
    pub fn new(changes: impl IntoIterator<Item = Change>) -> Self {
        Self {
            changes: Mutex::new(
                changes
                    .into_iter()
                    .map(|c| (c.change_key().clone(), c))
                    .collect(),
            ),
        }
    }
}

fn stamped(change: &Change, inserted: Option<DateTime<Utc>>, execution: &DeployExecution) -> Change {
    let mut record = change.clone();
    record.time_inserted = inserted.or(Some(execution.started_at));
    record.time_updated = Some(execution.started_at);
    record
}

#[async_trait]
impl ChangeAuditDao for InMemoryAuditDao {
    async fn deployed_changes(&self) -> Result<Vec<Change>> {
        Ok(self.changes.lock().await.values().cloned().collect())
    }

    async fn insert_new_change(&self, change: &Change, execution: &DeployExecution) -> Result<()> {
        self.changes
            .lock()
            .await
            .insert(change.change_key().clone(), stamped(change, None, execution));
        Ok(())
    }

    async fn update_or_insert_change(&self, change: &Change, execution: &DeployExecution) -> Result<()> {
        let mut changes = self.changes.lock().await;
        let inserted = changes
            .get(change.change_key())
            .and_then(|existing| existing.time_inserted);
        changes.insert(change.change_key().clone(), stamped(change, inserted, execution));
        Ok(())
    }

    async fn delete_change(&self, change: &Change) -> Result<()> {
        self.changes.lock().await.remove(change.change_key());
        Ok(())
    }

    async fn delete_object_changes(&self, change: &Change) -> Result<()> {
        self.changes
            .lock()
            .await
            .retain(|key, _| &key.object_key != change.object_key());
        Ok(())
    }
}
