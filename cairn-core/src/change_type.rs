//! Change-type descriptors and the per-platform registry.

use std::collections::BTreeMap;

use crate::change::Change;
use crate::db::quote_ident;
use crate::error::{CairnError, Result};

pub const TABLE: &str = "TABLE";
pub const FOREIGN_KEY: &str = "FOREIGN_KEY";
pub const INDEX: &str = "INDEX";
pub const MIGRATION: &str = "MIGRATION";
pub const SEQUENCE: &str = "SEQUENCE";
pub const USERTYPE: &str = "USERTYPE";
pub const FUNCTION: &str = "FUNCTION";
pub const VIEW: &str = "VIEW";
pub const SP: &str = "SP";
pub const STATICDATA: &str = "STATICDATA";
pub const TRIGGER: &str = "TRIGGER";

/// Describes how one kind of database object is diffed, ordered and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeType {
    pub name: String,
    /// Directory name under `<location>/<schema>/`.
    pub directory: String,
    pub rerunnable: bool,
    pub deploy_order_priority: i32,
    /// Redeploy dependents when an object of this type changes.
    pub dependent_recalculation: bool,
    pub drop_keyword: Option<String>,
    pub discover_dependencies: bool,
}

impl ChangeType {
    pub fn new(name: &str, rerunnable: bool, deploy_order_priority: i32) -> Self {
        Self {
            name: name.to_string(),
            directory: name.to_ascii_lowercase(),
            rerunnable,
            deploy_order_priority,
            dependent_recalculation: false,
            drop_keyword: None,
            discover_dependencies: true,
        }
    }

    pub fn with_drop_keyword(mut self, keyword: &str) -> Self {
        self.drop_keyword = Some(keyword.to_string());
        self
    }

    pub fn with_dependent_recalculation(mut self) -> Self {
        self.dependent_recalculation = true;
        self
    }

    pub fn without_dependency_discovery(mut self) -> Self {
        self.discover_dependencies = false;
        self
    }

    /// Whether [`drop_sql`](Self::drop_sql) has a statement for `change`.
    pub fn can_drop(&self, change: &Change) -> bool {
        change.drop_content.is_some()
            || self.drop_keyword.is_some()
            || change
                .incremental_info()
                .is_some_and(|info| info.drop && !change.content.trim().is_empty())
    }

    /// SQL that removes the object behind `change`.
    ///
    /// An explicit drop statement wins, then the content of an incremental
    /// drop change, then `DROP <keyword> IF EXISTS ... CASCADE`.
    pub fn drop_sql(&self, change: &Change) -> Result<String> {
        if let Some(sql) = &change.drop_content {
            return Ok(sql.clone());
        }
        let is_drop_change = change.incremental_info().is_some_and(|info| info.drop);
        if is_drop_change && !change.content.trim().is_empty() {
            return Ok(change.content.clone());
        }
        match &self.drop_keyword {
            Some(keyword) => Ok(format!(
                "DROP {} IF EXISTS {}.{} CASCADE",
                keyword,
                quote_ident(change.schema()),
                quote_ident(change.object_name())
            )),
            None => Err(CairnError::CommandFailed {
                command: format!("drop {}", change.object_key()),
                reason: format!("change type {} has no drop statement", self.name),
            }),
        }
    }
}

/// Lookup table from type name to descriptor, built once per run.
#[derive(Debug, Clone, Default)]
pub struct ChangeTypeRegistry {
    types: BTreeMap<String, ChangeType>,
}

impl ChangeTypeRegistry {
    pub fn new(types: impl IntoIterator<Item = ChangeType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// The PostgreSQL change types.
    pub fn postgres() -> Self {
        Self::new([
            ChangeType::new(TABLE, false, 10).with_drop_keyword("TABLE"),
            ChangeType::new(MIGRATION, false, 41).without_dependency_discovery(),
            ChangeType::new(INDEX, false, 49),
            ChangeType::new(FOREIGN_KEY, false, 50),
            ChangeType::new(SEQUENCE, true, 1).with_drop_keyword("SEQUENCE"),
            ChangeType::new(USERTYPE, true, 1).with_drop_keyword("TYPE"),
            ChangeType::new(FUNCTION, true, 15).with_drop_keyword("FUNCTION"),
            ChangeType::new(VIEW, true, 20)
                .with_drop_keyword("VIEW")
                .with_dependent_recalculation(),
            ChangeType::new(SP, true, 30).with_drop_keyword("PROCEDURE"),
            ChangeType::new(STATICDATA, true, 40),
            ChangeType::new(TRIGGER, true, 52).with_drop_keyword("TRIGGER"),
        ])
    }

    pub fn get(&self, name: &str) -> Result<&ChangeType> {
        self.types
            .get(name)
            .ok_or_else(|| CairnError::UnknownChangeTypeError(name.to_string()))
    }

    pub fn by_directory(&self, directory: &str) -> Option<&ChangeType> {
        self.types.values().find(|t| t.directory == directory)
    }

    /// Deploy-order priority of `name`; unknown types sort last.
    pub fn priority(&self, name: &str) -> i32 {
        self.types
            .get(name)
            .map_or(i32::MAX, |t| t.deploy_order_priority)
    }

    pub fn types(&self) -> impl Iterator<Item = &ChangeType> {
        self.types.values()
    }
}
