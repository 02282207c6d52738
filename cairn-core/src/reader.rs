//! Source tree reading: `<location>/<schema>/<type>/<object>.sql` into changes.
//!
//! Incremental files hold `//// CHANGE name=...` sections, each optionally
//! followed by a `// ROLLBACK` script. Rerunnable files hold one definition,
//! optionally preceded by a `//// METADATA` line.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::change::{Change, CodeDependency, ObjectKey};
use crate::change_type::{ChangeType, ChangeTypeRegistry, FOREIGN_KEY, INDEX};
use crate::checksum::line_checksum;
use crate::error::{CairnError, Result};
use crate::graph::enricher::NameCase;

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^////\s*(CHANGE|METADATA|DROP_COMMAND)\b(.*)$").unwrap());
static ROLLBACK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^//\s*ROLLBACK\s*$").unwrap());
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_][\w-]*)(?:\s*=\s*(?:"([^"]*)"|(\S+)))?"#).unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/|--[^\n]*").unwrap());
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_$]*(?:\.[A-Za-z_][A-Za-z0-9_$]*)*").unwrap());

const KNOWN_ATTRS: &[&str] = &[
    "name",
    "baselinedChanges",
    "dependencies",
    "includeDependencies",
    "excludeDependencies",
    "changeset",
    "parallelGroup",
    "active",
    "order",
    "permissionScheme",
];
const KNOWN_TOGGLES: &[&str] = &[
    "FK",
    "TRIGGER",
    "INDEX",
    "DROP_TABLE",
    "INACTIVE",
    "keepIncrementalOrder",
    "rollbackIfAlreadyDeployed",
];

/// Parsed `key=value` attributes and bare toggles of a section header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub values: BTreeMap<String, String>,
    pub toggles: BTreeSet<String>,
}

impl Attributes {
    pub fn parse(text: &str) -> Self {
        let mut attrs = Self::default();
        for caps in ATTR_RE.captures_iter(text) {
            let key = caps[1].to_string();
            match caps.get(2).or_else(|| caps.get(3)) {
                Some(value) => {
                    attrs.values.insert(key, value.as_str().to_string());
                }
                None => {
                    attrs.toggles.insert(key);
                }
            }
        }
        attrs
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn has(&self, toggle: &str) -> bool {
        self.toggles.contains(toggle)
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Layer `other` on top of these attributes.
    fn merged_with(&self, other: &Attributes) -> Attributes {
        let mut merged = self.clone();
        merged.values.extend(other.values.clone());
        merged.toggles.extend(other.toggles.iter().cloned());
        merged
    }
}

/// A change plus the dependency directives that still need resolving.
#[derive(Debug)]
struct ParsedChange {
    change: Change,
    explicit: Option<Vec<String>>,
    include: Vec<String>,
    exclude: Vec<String>,
    discover: bool,
}

fn parse_error(path: &Path, message: impl std::fmt::Display) -> CairnError {
    CairnError::SourceParseError(format!("{}: {}", path.display(), message))
}

fn joined(lines: &[&str]) -> String {
    lines.join("\n").trim().to_string()
}

/// Apply the attributes every change kind shares.
fn apply_common(mut change: Change, attrs: &Attributes, discover: bool, path: &Path) -> Result<ParsedChange> {
    if let Some(order) = attrs.get("order") {
        change.order = order
            .parse()
            .map_err(|_| parse_error(path, format!("order '{}' is not an integer", order)))?;
    }
    if let Some(active) = attrs.get("active") {
        change.active = !active.eq_ignore_ascii_case("false");
    }
    if attrs.has("INACTIVE") {
        change.active = false;
    }
    change.changeset = attrs.get("changeset").map(str::to_string);
    change.permission_scheme = attrs.get("permissionScheme").map(str::to_string);
    for (key, value) in &attrs.values {
        if !KNOWN_ATTRS.contains(&key.as_str()) {
            change.metadata.insert(key.clone(), value.clone());
        }
    }
    for toggle in &attrs.toggles {
        if !KNOWN_TOGGLES.contains(&toggle.as_str()) {
            change.metadata.insert(toggle.clone(), String::new());
        }
    }
    change.acceptable_hashes.insert(line_checksum(&change.content));

    Ok(ParsedChange {
        change,
        explicit: attrs.list("dependencies"),
        include: attrs.list("includeDependencies").unwrap_or_default(),
        exclude: attrs.list("excludeDependencies").unwrap_or_default(),
        discover,
    })
}

struct Section<'t> {
    attrs: Attributes,
    body: Vec<&'t str>,
    rollback: Option<Vec<&'t str>>,
}

fn parse_incremental(
    schema: &str,
    change_type: &ChangeType,
    object: &str,
    text: &str,
    path: &Path,
) -> Result<Vec<ParsedChange>> {
    let mut file_attrs = Attributes::default();
    let mut sections: Vec<Section> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = SECTION_RE.captures(line.trim_end()) {
            let attrs = Attributes::parse(&caps[2]);
            match &caps[1] {
                "CHANGE" => sections.push(Section {
                    attrs,
                    body: Vec::new(),
                    rollback: None,
                }),
                "METADATA" if sections.is_empty() => file_attrs = attrs,
                other => return Err(parse_error(path, format!("unexpected //// {} line", other))),
            }
            continue;
        }

        match sections.last_mut() {
            None => {
                let trimmed = line.trim();
                if !(trimmed.is_empty() || trimmed.starts_with("--") || trimmed.starts_with("//")) {
                    return Err(parse_error(
                        path,
                        "content before the first //// CHANGE line must be blank or comments",
                    ));
                }
            }
            Some(section) if ROLLBACK_RE.is_match(line.trim()) => {
                if section.rollback.is_some() {
                    return Err(parse_error(path, "a change may only have one // ROLLBACK script"));
                }
                section.rollback = Some(Vec::new());
            }
            Some(section) => match &mut section.rollback {
                Some(rollback) => rollback.push(line),
                None => section.body.push(line),
            },
        }
    }

    if sections.is_empty() {
        return Err(parse_error(path, "no //// CHANGE sections found"));
    }

    let mut names: HashSet<String> = HashSet::new();
    let mut parsed = Vec::with_capacity(sections.len());
    for (position, section) in sections.into_iter().enumerate() {
        let attrs = file_attrs.merged_with(&section.attrs);
        let name = attrs
            .get("name")
            .ok_or_else(|| parse_error(path, format!("change #{} has no name attribute", position + 1)))?
            .to_string();
        if !names.insert(name.clone()) {
            return Err(parse_error(path, format!("duplicate change name '{}'", name)));
        }

        // TRIGGER sections stay with the table they are declared in
        let section_type = if attrs.has("FK") {
            FOREIGN_KEY
        } else if attrs.has("INDEX") {
            INDEX
        } else {
            change_type.name.as_str()
        };
        let order_within_object = i32::try_from(position)
            .map_err(|_| parse_error(path, "too many changes in one file"))?;

        let mut change = Change::incremental(
            schema,
            section_type,
            object,
            &name,
            order_within_object,
            &joined(&section.body),
        )
        .with_drop(attrs.has("DROP_TABLE"))
        .with_keep_incremental_order(attrs.has("keepIncrementalOrder"))
        .with_rollback_if_already_deployed(attrs.has("rollbackIfAlreadyDeployed"));
        if let Some(baselines) = attrs.list("baselinedChanges") {
            change = change.with_baselines(baselines);
        }
        if let Some(group) = attrs.get("parallelGroup") {
            change = change.with_parallel_group(group);
        }
        if let Some(rollback) = &section.rollback {
            change.rollback_content = Some(joined(rollback));
        }
        parsed.push(apply_common(change, &attrs, change_type.discover_dependencies, path)?);
    }
    Ok(parsed)
}

fn parse_rerunnable(
    schema: &str,
    change_type: &ChangeType,
    object: &str,
    text: &str,
    path: &Path,
) -> Result<ParsedChange> {
    let mut attrs = Attributes::default();
    let mut body: Vec<&str> = Vec::new();
    let mut drop_command: Option<Vec<&str>> = None;

    for line in text.lines() {
        if let Some(caps) = SECTION_RE.captures(line.trim_end()) {
            match &caps[1] {
                "METADATA" if body.iter().all(|l| l.trim().is_empty()) && drop_command.is_none() => {
                    attrs = Attributes::parse(&caps[2]);
                }
                "DROP_COMMAND" if drop_command.is_none() => drop_command = Some(Vec::new()),
                other => {
                    return Err(parse_error(
                        path,
                        format!("//// {} is not allowed here in a {} file", other, change_type.name),
                    ))
                }
            }
            continue;
        }
        match &mut drop_command {
            Some(lines) => lines.push(line),
            None => body.push(line),
        }
    }

    let mut change = Change::rerunnable(schema, &change_type.name, object, &joined(&body));
    change.drop_content = drop_command.map(|lines| joined(&lines)).filter(|s| !s.is_empty());
    apply_common(change, &attrs, change_type.discover_dependencies, path)
}

/// Identifier tokens of `content` naming a known object, outside comments.
///
/// `known` holds `(schema, object)` pairs, both normalized with `name_case`.
fn discover_references(
    content: &str,
    schema: &str,
    object: &str,
    known: &HashSet<(String, String)>,
    name_case: NameCase,
) -> BTreeSet<String> {
    let stripped = COMMENT_RE.replace_all(content, " ");
    let own_schema = name_case.normalize(schema);
    let own_object = name_case.normalize(object);
    let mut found = BTreeSet::new();

    for token in IDENT_RE.find_iter(&stripped) {
        let parts: Vec<String> = token.as_str().split('.').map(|p| name_case.normalize(p)).collect();
        if parts.len() >= 2 && known.contains(&(parts[0].clone(), parts[1].clone())) {
            if !(parts[0] == own_schema && parts[1] == own_object) {
                found.insert(format!("{}.{}", parts[0], parts[1]));
            }
            continue;
        }
        for part in &parts {
            if *part != own_object && known.contains(&(own_schema.clone(), part.clone())) {
                found.insert(part.clone());
            }
        }
    }
    found
}

/// Entries of `dir` sorted by path, skipping hidden ones.
fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CairnError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read source directory '{}': {}", dir.display(), e),
        ))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_none_or(|n| n.starts_with('.'));
        if !hidden {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Reads source trees into changes, resolving their dependencies.
pub struct SourceReader<'a> {
    registry: &'a ChangeTypeRegistry,
    name_case: NameCase,
}

impl<'a> SourceReader<'a> {
    pub fn new(registry: &'a ChangeTypeRegistry, name_case: NameCase) -> Self {
        Self { registry, name_case }
    }

    /// Parse one file's text. Dependencies are left unresolved.
    pub fn parse_file(&self, schema: &str, change_type: &str, object: &str, text: &str) -> Result<Vec<Change>> {
        let parsed = self.parse(schema, self.registry.get(change_type)?, object, text, Path::new(object))?;
        Ok(parsed.into_iter().map(|p| p.change).collect())
    }

    fn parse(
        &self,
        schema: &str,
        change_type: &ChangeType,
        object: &str,
        text: &str,
        path: &Path,
    ) -> Result<Vec<ParsedChange>> {
        if change_type.rerunnable {
            Ok(vec![parse_rerunnable(schema, change_type, object, text, path)?])
        } else {
            parse_incremental(schema, change_type, object, text, path)
        }
    }

    /// Read every schema under `locations`, or only `schemas` when non-empty.
    pub fn read(&self, locations: &[PathBuf], schemas: &[String]) -> Result<Vec<Change>> {
        let mut parsed: Vec<ParsedChange> = Vec::new();
        let mut origins: HashMap<ObjectKey, PathBuf> = HashMap::new();

        for location in locations {
            if !location.exists() {
                tracing::warn!(location = %location.display(), "Source location does not exist");
                continue;
            }

            for schema_dir in sorted_entries(location)? {
                let Some(schema) = file_name(&schema_dir).map(str::to_string) else {
                    continue;
                };
                if !schema_dir.is_dir() || (!schemas.is_empty() && !schemas.contains(&schema)) {
                    continue;
                }

                for type_dir in sorted_entries(&schema_dir)? {
                    if !type_dir.is_dir() {
                        continue;
                    }
                    let directory = file_name(&type_dir).unwrap_or_default();
                    let change_type = self
                        .registry
                        .by_directory(directory)
                        .ok_or_else(|| CairnError::UnknownChangeTypeError(directory.to_string()))?;

                    for file in sorted_entries(&type_dir)? {
                        let Some(object) = file_name(&file).and_then(|n| n.strip_suffix(".sql")) else {
                            continue;
                        };
                        if !file.is_file() {
                            continue;
                        }

                        let key = ObjectKey::new(&schema, &change_type.name, object);
                        if let Some(previous) = origins.insert(key.clone(), file.clone()) {
                            return Err(parse_error(
                                &file,
                                format!("object {} is also defined in {}", key, previous.display()),
                            ));
                        }

                        let text = std::fs::read_to_string(&file)?;
                        let changes = self.parse(&schema, change_type, object, &text, &file)?;
                        tracing::debug!(file = %file.display(), changes = changes.len(), "Read source file");
                        parsed.extend(changes);
                    }
                }
            }
        }

        for schema in schemas {
            if !parsed.iter().any(|p| p.change.schema() == schema) {
                tracing::warn!(schema = %schema, "No source files found for schema");
            }
        }

        Ok(self.resolve_dependencies(parsed))
    }

    fn resolve_dependencies(&self, parsed: Vec<ParsedChange>) -> Vec<Change> {
        let known: HashSet<(String, String)> = parsed
            .iter()
            .map(|p| {
                (
                    self.name_case.normalize(p.change.schema()),
                    self.name_case.normalize(p.change.object_name()),
                )
            })
            .collect();

        parsed
            .into_iter()
            .map(|p| {
                let mut change = p.change;
                let mut dependencies: Vec<CodeDependency> = match p.explicit {
                    Some(explicit) => explicit.iter().map(|t| CodeDependency::explicit(t)).collect(),
                    None if p.discover => {
                        let excluded: HashSet<String> =
                            p.exclude.iter().map(|e| self.name_case.normalize(e)).collect();
                        discover_references(
                            &change.content,
                            change.schema(),
                            change.object_name(),
                            &known,
                            self.name_case,
                        )
                        .into_iter()
                        .filter(|target| !excluded.contains(target))
                        .map(|target| CodeDependency::discovered(&target))
                        .collect()
                    }
                    None => Vec::new(),
                };
                dependencies.extend(p.include.iter().map(|t| CodeDependency::explicit(t)));
                change.dependencies = dependencies;
                change
            })
            .collect()
    }
}
