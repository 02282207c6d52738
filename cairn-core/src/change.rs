//! Change model: object/change identities, incremental and rerunnable
//! changes, and the source/deployed pairing the calculators work on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::checksum::content_hash;

/// Relative deploy order used when a change does not declare one.
pub const DEFAULT_CHANGE_ORDER: i32 = 500;

/// Change name carried by every rerunnable change.
pub const RERUNNABLE_CHANGE_NAME: &str = "n/a";

static CREATE_OR_REPLACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)create\s+or\s+replace").unwrap());

/// Identity of a database object: schema, change type and object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectKey {
    pub schema: String,
    pub change_type: String,
    pub object_name: String,
}

impl ObjectKey {
    pub fn new(schema: &str, change_type: &str, object_name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            change_type: change_type.to_string(),
            object_name: object_name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.schema, self.object_name, self.change_type)
    }
}

/// Identity of a single change within an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChangeKey {
    pub object_key: ObjectKey,
    pub change_name: String,
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} ({})",
            self.object_key.schema,
            self.object_key.object_name,
            self.change_name,
            self.object_key.change_type
        )
    }
}

/// How a dependency edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DependencyKind {
    /// Declared by the author through the `dependencies`/`includeDependencies` attributes.
    Explicit,
    /// Found by scanning the change content for known object names.
    Discovered,
    /// Implied by the order of changes within an incremental object.
    Implicit,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Explicit => write!(f, "EXPLICIT"),
            DependencyKind::Discovered => write!(f, "DISCOVERED"),
            DependencyKind::Implicit => write!(f, "IMPLICIT"),
        }
    }
}

/// A free-text reference from one change to another object or change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeDependency {
    pub target: String,
    pub kind: DependencyKind,
}

impl CodeDependency {
    pub fn explicit(target: &str) -> Self {
        Self {
            target: target.to_string(),
            kind: DependencyKind::Explicit,
        }
    }

    pub fn discovered(target: &str) -> Self {
        Self {
            target: target.to_string(),
            kind: DependencyKind::Discovered,
        }
    }
}

/// Fields only incremental changes carry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrementalInfo {
    pub order_within_object: i32,
    /// Names of earlier changes this change supersedes.
    pub baselined_changes: BTreeSet<String>,
    pub drop: bool,
    pub keep_incremental_order: bool,
    pub manually_coded_drop: bool,
    pub force_drop_for_env_cleaning: bool,
    pub rollback_if_already_deployed: bool,
    pub parallel_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Incremental(IncrementalInfo),
    Rerunnable,
}

/// One versioned definition of a database object, or a fragment of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    key: ChangeKey,
    pub kind: ChangeKind,
    pub content: String,
    pub content_hash: String,
    /// Older hashes that still count as a match for this content.
    pub acceptable_hashes: BTreeSet<String>,
    pub rollback_content: Option<String>,
    pub drop_content: Option<String>,
    pub active: bool,
    pub order: i32,
    pub permission_scheme: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub dependencies: Vec<CodeDependency>,
    pub changeset: Option<String>,
    pub time_inserted: Option<DateTime<Utc>>,
    pub time_updated: Option<DateTime<Utc>>,
}

impl Change {
    fn with_kind(
        schema: &str,
        change_type: &str,
        object_name: &str,
        change_name: &str,
        kind: ChangeKind,
        content: &str,
    ) -> Self {
        Self {
            key: ChangeKey {
                object_key: ObjectKey::new(schema, change_type, object_name),
                change_name: change_name.to_string(),
            },
            kind,
            content: content.to_string(),
            content_hash: content_hash(content),
            acceptable_hashes: BTreeSet::new(),
            rollback_content: None,
            drop_content: None,
            active: true,
            order: DEFAULT_CHANGE_ORDER,
            permission_scheme: None,
            metadata: BTreeMap::new(),
            dependencies: Vec::new(),
            changeset: None,
            time_inserted: None,
            time_updated: None,
        }
    }

    /// Create an incremental change; the hash is computed from `content`.
    pub fn incremental(
        schema: &str,
        change_type: &str,
        object_name: &str,
        change_name: &str,
        order_within_object: i32,
        content: &str,
    ) -> Self {
        let info = IncrementalInfo {
            order_within_object,
            ..Default::default()
        };
        Self::with_kind(
            schema,
            change_type,
            object_name,
            change_name,
            ChangeKind::Incremental(info),
            content,
        )
    }

    /// Create a rerunnable change; the hash is computed from `content`.
    pub fn rerunnable(schema: &str, change_type: &str, object_name: &str, content: &str) -> Self {
        Self::with_kind(
            schema,
            change_type,
            object_name,
            RERUNNABLE_CHANGE_NAME,
            ChangeKind::Rerunnable,
            content,
        )
    }

    pub fn with_hash(mut self, hash: &str) -> Self {
        self.content_hash = hash.to_string();
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_rollback(mut self, rollback: &str) -> Self {
        self.rollback_content = Some(rollback.to_string());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<CodeDependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_changeset(mut self, changeset: &str) -> Self {
        self.changeset = Some(changeset.to_string());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_drop(mut self, drop: bool) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.drop = drop;
        }
        self
    }

    pub fn with_keep_incremental_order(mut self, keep: bool) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.keep_incremental_order = keep;
        }
        self
    }

    pub fn with_manually_coded_drop(mut self, manual: bool) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.manually_coded_drop = manual;
        }
        self
    }

    pub fn with_force_drop_for_env_cleaning(mut self, force: bool) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.force_drop_for_env_cleaning = force;
        }
        self
    }

    pub fn with_rollback_if_already_deployed(mut self, flag: bool) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.rollback_if_already_deployed = flag;
        }
        self
    }

    pub fn with_baselines<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(info) = self.incremental_info_mut() {
            info.baselined_changes = names.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_parallel_group(mut self, group: &str) -> Self {
        if let Some(info) = self.incremental_info_mut() {
            info.parallel_group = Some(group.to_string());
        }
        self
    }

    pub fn schema(&self) -> &str {
        &self.key.object_key.schema
    }

    pub fn change_type(&self) -> &str {
        &self.key.object_key.change_type
    }

    pub fn object_name(&self) -> &str {
        &self.key.object_key.object_name
    }

    pub fn change_name(&self) -> &str {
        &self.key.change_name
    }

    pub fn object_key(&self) -> &ObjectKey {
        &self.key.object_key
    }

    pub fn change_key(&self) -> &ChangeKey {
        &self.key
    }

    pub fn incremental_info(&self) -> Option<&IncrementalInfo> {
        match &self.kind {
            ChangeKind::Incremental(info) => Some(info),
            ChangeKind::Rerunnable => None,
        }
    }

    pub fn incremental_info_mut(&mut self) -> Option<&mut IncrementalInfo> {
        match &mut self.kind {
            ChangeKind::Incremental(info) => Some(info),
            ChangeKind::Rerunnable => None,
        }
    }

    pub fn is_rerunnable(&self) -> bool {
        matches!(self.kind, ChangeKind::Rerunnable)
    }

    /// Position within the object; rerunnable changes are always 0.
    pub fn order_within_object(&self) -> i32 {
        self.incremental_info().map_or(0, |info| info.order_within_object)
    }

    /// Whether the content replaces the object in place (`CREATE OR REPLACE ...`).
    pub fn is_create_or_replace(&self) -> bool {
        CREATE_OR_REPLACE_RE.is_match(&self.content)
    }

    /// Whether `hash` matches this change's content, exactly or through an acceptable hash.
    pub fn hash_matches(&self, hash: &str) -> bool {
        self.content_hash == hash || self.acceptable_hashes.contains(hash)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}.{}]", self.object_name(), self.change_name())
    }
}

/// The (source, deployed) pairing of one change. At least one side is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePair {
    SourceOnly(Change),
    DeployedOnly(Change),
    Both { source: Change, deployed: Change },
}

impl ChangePair {
    /// Build a pair from optional sides; `None` when both are absent.
    pub fn new(source: Option<Change>, deployed: Option<Change>) -> Option<Self> {
        match (source, deployed) {
            (Some(source), Some(deployed)) => Some(ChangePair::Both { source, deployed }),
            (Some(source), None) => Some(ChangePair::SourceOnly(source)),
            (None, Some(deployed)) => Some(ChangePair::DeployedOnly(deployed)),
            (None, None) => None,
        }
    }

    pub fn source(&self) -> Option<&Change> {
        match self {
            ChangePair::SourceOnly(source) | ChangePair::Both { source, .. } => Some(source),
            ChangePair::DeployedOnly(_) => None,
        }
    }

    pub fn deployed(&self) -> Option<&Change> {
        match self {
            ChangePair::DeployedOnly(deployed) | ChangePair::Both { deployed, .. } => Some(deployed),
            ChangePair::SourceOnly(_) => None,
        }
    }

    /// The change representing this pair, preferring the source side.
    pub fn change(&self) -> &Change {
        match self {
            ChangePair::SourceOnly(change) | ChangePair::DeployedOnly(change) => change,
            ChangePair::Both { source, .. } => source,
        }
    }

    pub fn object_key(&self) -> &ObjectKey {
        self.change().object_key()
    }
}
