//! Drops every managed object from an environment, retrying until it converges.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::change::Change;
use crate::change_type::{ChangeTypeRegistry, FOREIGN_KEY};
use crate::changeset::{Changeset, ChangesetCreator, ChangesetOptions, ChangesetSelection};
use crate::command::{ExecuteCommand, ExecutionContext, SqlExecutor};
use crate::error::{CairnError, Result};
use crate::graph::enricher::GraphEnricher;
use crate::metadata::{LiveObject, MetadataReader};

/// Upper bound on drop passes before giving up.
pub const MAX_CLEAN_PASSES: usize = 10;

/// Hash given to synthetic deployed changes; never compared against source.
const CLEAN_HASH: &str = "hash";

/// Asked once, with the drop plan, before anything is dropped.
pub type ConfirmFn<'a> = &'a (dyn Fn(&[ExecuteCommand]) -> bool + Send + Sync);

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub schemas: Vec<String>,
    /// Descriptions of the drop commands that succeeded, in execution order.
    pub dropped: Vec<String>,
    pub passes: usize,
}

pub struct EnvironmentCleaner<'a> {
    registry: &'a ChangeTypeRegistry,
    enricher: GraphEnricher,
    reader: &'a dyn MetadataReader,
    executor: &'a dyn SqlExecutor,
    tokens: &'a HashMap<String, String>,
}

impl<'a> EnvironmentCleaner<'a> {
    pub fn new(
        registry: &'a ChangeTypeRegistry,
        enricher: GraphEnricher,
        reader: &'a dyn MetadataReader,
        executor: &'a dyn SqlExecutor,
        tokens: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            enricher,
            reader,
            executor,
            tokens,
        }
    }

    /// Turn the live objects of `schemas` into a changeset that drops all of them.
    ///
    /// Rerunnable objects appear as deployed changes missing from source;
    /// incremental objects as forced drop changes.
    pub async fn plan(&self, schemas: &[String]) -> Result<Changeset> {
        let mut seen: HashSet<LiveObject> = HashSet::new();
        let mut deployed = Vec::new();
        let mut sources = Vec::new();

        for schema in schemas {
            for object in self.reader.live_objects(schema).await? {
                if !seen.insert(object.clone()) {
                    continue;
                }
                let change_type = self.registry.get(&object.change_type)?;
                if change_type.rerunnable {
                    let mut change = Change::rerunnable(&object.schema, &object.change_type, &object.name, "")
                        .with_hash(CLEAN_HASH);
                    change.drop_content = object.drop_sql;
                    deployed.push(change);
                    continue;
                }

                let name = format!("change{}", sources.len());
                let change = if object.change_type == FOREIGN_KEY {
                    // constraints go before the table they belong to
                    let content = object.drop_sql.unwrap_or_default();
                    Change::incremental(&object.schema, &object.change_type, &object.name, &name, 1, &content)
                        .with_manually_coded_drop(true)
                } else {
                    let mut change =
                        Change::incremental(&object.schema, &object.change_type, &object.name, &name, 0, "");
                    change.drop_content = object.drop_sql;
                    change
                };
                sources.push(change.with_drop(true).with_force_drop_for_env_cleaning(true));
            }
        }

        let options = ChangesetOptions {
            selection: ChangesetSelection::All,
            ..Default::default()
        };
        ChangesetCreator::new(self.registry, self.enricher, 1).determine_changeset(
            deployed,
            sources.clone(),
            &sources,
            &options,
        )
    }

    /// Drop everything in `schemas`.
    ///
    /// Failed drops are retried in a fresh pass as long as each pass fails
    /// fewer commands than the one before, for at most [`MAX_CLEAN_PASSES`].
    pub async fn clean(&self, schemas: &[String], confirm: Option<ConfirmFn<'_>>) -> Result<CleanReport> {
        let mut report = CleanReport {
            schemas: schemas.to_vec(),
            ..Default::default()
        };
        let ctx = ExecutionContext {
            executor: self.executor,
            registry: self.registry,
            tokens: self.tokens,
        };
        let mut confirmed = confirm.is_none();
        let mut failure_bound: Option<usize> = None;

        for pass in 1..=MAX_CLEAN_PASSES {
            let changeset = self.plan(schemas).await?;
            changeset.validate_for_deployment()?;
            if changeset.immediate.is_empty() {
                tracing::info!(pass, "Nothing left to clean");
                return Ok(report);
            }

            report.passes = pass;
            for command in &changeset.immediate {
                tracing::info!(pass, command = %command, "Planned drop");
            }
            if !confirmed {
                if let Some(confirm) = confirm {
                    if !confirm(&changeset.immediate) {
                        return Err(CairnError::CleanAbortedError);
                    }
                }
                confirmed = true;
            }

            let mut errors = Vec::new();
            for command in &changeset.immediate {
                match command.execute(&ctx).await {
                    Ok(()) => report.dropped.push(command.description()),
                    Err(e) => {
                        tracing::warn!(pass, command = %command, error = %e, "Drop failed");
                        errors.push(format!("{}: {}", command, e));
                    }
                }
            }
            if errors.is_empty() {
                tracing::info!(pass, dropped = report.dropped.len(), "Clean completed");
                return Ok(report);
            }

            let bound = failure_bound.unwrap_or(changeset.immediate.len());
            if errors.len() >= bound || pass == MAX_CLEAN_PASSES {
                return Err(CairnError::CleanFailedError { attempts: pass, errors });
            }
            tracing::info!(pass, failures = errors.len(), "Retrying failed drops");
            failure_bound = Some(errors.len());
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_type::{TABLE, VIEW};
    use crate::command::tests::RecordingExecutor;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns one scripted listing per call, then nothing.
    struct ScriptedReader {
        passes: Mutex<VecDeque<Vec<LiveObject>>>,
    }

    impl ScriptedReader {
        fn new(passes: Vec<Vec<LiveObject>>) -> Self {
            Self {
                passes: Mutex::new(passes.into()),
            }
        }
    }

    #[async_trait]
    impl MetadataReader for ScriptedReader {
        async fn live_objects(&self, _schema: &str) -> Result<Vec<LiveObject>> {
            Ok(self.passes.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn views(names: &[&str]) -> Vec<LiveObject> {
        names.iter().map(|n| LiveObject::new("app", VIEW, n)).collect()
    }

    async fn run(
        reader: &ScriptedReader,
        executor: &RecordingExecutor,
        confirm: Option<ConfirmFn<'_>>,
    ) -> Result<CleanReport> {
        let registry = ChangeTypeRegistry::postgres();
        let tokens = HashMap::new();
        EnvironmentCleaner::new(&registry, GraphEnricher::default(), reader, executor, &tokens)
            .clean(&["app".to_string()], confirm)
            .await
    }

    fn statements(executor: &RecordingExecutor) -> Vec<String> {
        executor
            .statements
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_drops_constraints_then_views_then_tables() {
        let reader = ScriptedReader::new(vec![vec![
            LiveObject::new("app", TABLE, "orders"),
            LiveObject::new("app", VIEW, "v_orders"),
            LiveObject::new("app", FOREIGN_KEY, "orders")
                .with_drop_sql("ALTER TABLE \"app\".\"orders\" DROP CONSTRAINT \"fk_customer\"".to_string()),
        ]]);
        let executor = RecordingExecutor::default();

        let report = run(&reader, &executor, None).await.unwrap();

        assert_eq!(report.passes, 1);
        assert_eq!(report.dropped.len(), 3);
        assert_eq!(
            statements(&executor),
            vec![
                "ALTER TABLE \"app\".\"orders\" DROP CONSTRAINT \"fk_customer\"",
                "DROP VIEW IF EXISTS \"app\".\"v_orders\" CASCADE",
                "DROP TABLE IF EXISTS \"app\".\"orders\" CASCADE",
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_listings_drop_once() {
        let reader = ScriptedReader::new(vec![views(&["v1", "v1"])]);
        let executor = RecordingExecutor::default();
        run(&reader, &executor, None).await.unwrap();
        assert_eq!(statements(&executor).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_environment_needs_no_confirmation() {
        let reader = ScriptedReader::new(vec![]);
        let executor = RecordingExecutor::default();
        let asked = AtomicUsize::new(0);
        let confirm = |_: &[ExecuteCommand]| {
            asked.fetch_add(1, Ordering::SeqCst);
            true
        };

        let report = run(&reader, &executor, Some(&confirm)).await.unwrap();
        assert_eq!(report.passes, 0);
        assert!(report.dropped.is_empty());
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declined_confirmation_drops_nothing() {
        let reader = ScriptedReader::new(vec![views(&["v1"])]);
        let executor = RecordingExecutor::default();
        let decline = |_: &[ExecuteCommand]| false;

        let result = run(&reader, &executor, Some(&decline)).await;
        assert!(matches!(result, Err(CairnError::CleanAbortedError)));
        assert!(statements(&executor).is_empty());
    }

    #[tokio::test]
    async fn test_retries_while_progressing_and_confirms_once() {
        // v_stuck never drops: the first pass makes progress, the second does not
        let reader = ScriptedReader::new(vec![views(&["v_ok", "v_stuck"]), views(&["v_stuck"])]);
        let executor = RecordingExecutor {
            fail_on: Some("v_stuck".to_string()),
            ..Default::default()
        };
        let asked = AtomicUsize::new(0);
        let confirm = |_: &[ExecuteCommand]| {
            asked.fetch_add(1, Ordering::SeqCst);
            true
        };

        let result = run(&reader, &executor, Some(&confirm)).await;
        match result {
            Err(CairnError::CleanFailedError { attempts, errors }) => {
                assert_eq!(attempts, 2);
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("v_stuck"));
            }
            other => panic!("expected CleanFailedError, got {:?}", other),
        }
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(statements(&executor), vec!["DROP VIEW IF EXISTS \"app\".\"v_ok\" CASCADE"]);
    }

    #[tokio::test]
    async fn test_first_pass_without_progress_fails() {
        let reader = ScriptedReader::new(vec![views(&["v_stuck"])]);
        let executor = RecordingExecutor {
            fail_on: Some("v_stuck".to_string()),
            ..Default::default()
        };
        let result = run(&reader, &executor, None).await;
        assert!(matches!(result, Err(CairnError::CleanFailedError { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_passes() {
        // every pass fails one command fewer than the previous
        let passes: Vec<Vec<LiveObject>> = (0..MAX_CLEAN_PASSES + 2)
            .map(|pass| {
                let failing = MAX_CLEAN_PASSES.saturating_sub(pass);
                let mut objects: Vec<LiveObject> = (0..failing)
                    .map(|i| LiveObject::new("app", VIEW, &format!("v_stuck_{}", i)))
                    .collect();
                objects.push(LiveObject::new("app", VIEW, &format!("v_ok_{}", pass)));
                objects
            })
            .collect();
        let reader = ScriptedReader::new(passes);
        let executor = RecordingExecutor {
            fail_on: Some("v_stuck".to_string()),
            ..Default::default()
        };

        let result = run(&reader, &executor, None).await;
        match result {
            Err(CairnError::CleanFailedError { attempts, errors }) => {
                assert_eq!(attempts, MAX_CLEAN_PASSES);
                assert_eq!(errors.len(), 1);
            }
            other => panic!("expected CleanFailedError, got {:?}", other),
        }
    }
}
