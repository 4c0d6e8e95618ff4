//! Load plans: what gets copied into staging and how each warehouse table
//! is derived from it.
//!
//! A plan is validated against the [`SchemaCatalog`] when it is built, so
//! the orchestrator can rely on every entry naming real tables and columns
//! and on dimension entries being mutually independent.

use crate::catalog::{SchemaCatalog, TableKind, TableSpec};
use crate::error::{CoreError, CoreResult};
use crate::names::{ColumnName, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// File format of an external source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Newline-delimited JSON or a JSON array (default)
    #[default]
    Json,
    /// CSV with a header row
    Csv,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Json => write!(f, "json"),
            SourceFormat::Csv => write!(f, "csv"),
        }
    }
}

/// External location a staging relation is bulk-copied from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingSource {
    /// File path, glob, or object-store URI
    pub uri: String,

    #[serde(default)]
    pub format: SourceFormat,

    /// Name of a credential registered with the warehouse, if the location needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
}

impl StagingSource {
    pub fn json(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            format: SourceFormat::Json,
            credential_ref: None,
        }
    }
}

/// Sort direction for a tie-break key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One tie-break key: a SQL expression over the source row. Nulls always sort last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub expr: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Inner join of another staging relation into the source row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Join {
    pub table: TableName,
    pub alias: String,
    /// Join condition, written against both aliases
    pub on: String,
}

/// Target column and the SQL expression that produces it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub column: ColumnName,
    pub expr: String,
}

impl Projection {
    pub fn new(column: &str, expr: impl Into<String>) -> Self {
        Self {
            column: ColumnName::new(column),
            expr: expr.into(),
        }
    }
}

/// Conflict resolution when a natural key already exists in the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum UpsertPolicy {
    /// Existing row wins; the incoming row is discarded
    InsertOnly,
    /// The listed mutable columns are overwritten by the incoming row
    InsertOrUpdate { columns: Vec<ColumnName> },
}

impl fmt::Display for UpsertPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertPolicy::InsertOnly => write!(f, "insert-only"),
            UpsertPolicy::InsertOrUpdate { columns } => {
                let cols: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
                write!(f, "insert-or-update({})", cols.join(", "))
            }
        }
    }
}

/// How canonical rows for one warehouse table are derived from staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transform {
    /// Alias of the source staging relation inside expressions
    pub source_alias: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<Join>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub projection: Vec<Projection>,
    /// Columns of the target identifying one canonical row
    pub natural_key: Vec<ColumnName>,
    /// Ordering used to pick one row among duplicates, before the row id
    pub tie_break: Vec<SortKey>,
    pub policy: UpsertPolicy,
}

impl Transform {
    pub fn new(source_alias: &str) -> Self {
        Self {
            source_alias: source_alias.to_string(),
            joins: Vec::new(),
            filter: None,
            projection: Vec::new(),
            natural_key: Vec::new(),
            tie_break: Vec::new(),
            policy: UpsertPolicy::InsertOnly,
        }
    }

    pub fn join(mut self, table: &str, alias: &str, on: impl Into<String>) -> Self {
        self.joins.push(Join {
            table: TableName::new(table),
            alias: alias.to_string(),
            on: on.into(),
        });
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn project(mut self, column: &str, expr: impl Into<String>) -> Self {
        self.projection.push(Projection::new(column, expr));
        self
    }

    pub fn key(mut self, columns: &[&str]) -> Self {
        self.natural_key = columns.iter().map(|c| ColumnName::new(*c)).collect();
        self
    }

    pub fn tie_break(mut self, key: SortKey) -> Self {
        self.tie_break.push(key);
        self
    }

    pub fn update(mut self, columns: &[&str]) -> Self {
        self.policy = UpsertPolicy::InsertOrUpdate {
            columns: columns.iter().map(|c| ColumnName::new(*c)).collect(),
        };
        self
    }

    /// Expression producing a projected column, if projected
    pub fn expr_for(&self, column: &str) -> Option<&str> {
        self.projection
            .iter()
            .find(|p| p.column == column)
            .map(|p| p.expr.as_str())
    }
}

/// One step of a load plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum LoadEntry {
    /// Bulk-copy an external location into a staging relation
    Staging {
        target: TableName,
        source: StagingSource,
    },
    /// Derive a dimension or fact table from a staging relation
    Table {
        source: TableName,
        target: TableName,
        transform: Transform,
    },
}

impl LoadEntry {
    pub fn staging(target: &str, source: StagingSource) -> Self {
        LoadEntry::Staging {
            target: TableName::new(target),
            source,
        }
    }

    pub fn table(source: &str, target: &str, transform: Transform) -> Self {
        LoadEntry::Table {
            source: TableName::new(source),
            target: TableName::new(target),
            transform,
        }
    }

    pub fn target(&self) -> &TableName {
        match self {
            LoadEntry::Staging { target, .. } | LoadEntry::Table { target, .. } => target,
        }
    }
}

/// Validated, dependency-ordered sequence of load entries
#[derive(Debug, Clone, Serialize)]
pub struct LoadPlan {
    staging: Vec<LoadEntry>,
    dimensions: Vec<LoadEntry>,
    facts: Vec<LoadEntry>,
}

impl LoadPlan {
    /// Validate entries against the catalog and group them by stage.
    ///
    /// Relative order within a stage is preserved.
    pub fn new(catalog: &SchemaCatalog, entries: Vec<LoadEntry>) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        let mut plan = Self {
            staging: Vec::new(),
            dimensions: Vec::new(),
            facts: Vec::new(),
        };

        for entry in entries {
            let target = catalog.get_table_spec(entry.target())?;
            if !seen.insert(target.name.clone()) {
                return Err(invalid(target.name.as_str(), "table is loaded twice"));
            }
            match &entry {
                LoadEntry::Staging { source, .. } => {
                    if target.kind != TableKind::Staging {
                        return Err(invalid(
                            target.name.as_str(),
                            "bulk copy must target a staging table",
                        ));
                    }
                    if source.uri.trim().is_empty() {
                        return Err(invalid(target.name.as_str(), "source uri is empty"));
                    }
                }
                LoadEntry::Table {
                    source, transform, ..
                } => validate_transform(catalog, target, source, transform)?,
            }
            match target.kind {
                TableKind::Staging => plan.staging.push(entry),
                TableKind::Dimension => plan.dimensions.push(entry),
                TableKind::Fact => plan.facts.push(entry),
            }
        }

        for entry in &plan.dimensions {
            for other in &plan.dimensions {
                if catalog.references(entry.target(), other.target()) {
                    return Err(invalid(
                        entry.target(),
                        &format!(
                            "dimension depends on dimension '{}' loaded in the same stage",
                            other.target()
                        ),
                    ));
                }
            }
        }

        log::debug!(
            "Load plan: {} staging, {} dimension, {} fact entries",
            plan.staging.len(),
            plan.dimensions.len(),
            plan.facts.len()
        );
        Ok(plan)
    }

    pub fn staging_entries(&self) -> &[LoadEntry] {
        &self.staging
    }

    pub fn dimension_entries(&self) -> &[LoadEntry] {
        &self.dimensions
    }

    pub fn fact_entries(&self) -> &[LoadEntry] {
        &self.facts
    }

    /// All entries in execution order
    pub fn entries(&self) -> impl Iterator<Item = &LoadEntry> {
        self.staging
            .iter()
            .chain(self.dimensions.iter())
            .chain(self.facts.iter())
    }

    pub fn len(&self) -> usize {
        self.staging.len() + self.dimensions.len() + self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The Sparkify plan: events and song catalog into staging, then the
    /// four dimensions, then `songplays`
    pub fn sparkify(
        catalog: &SchemaCatalog,
        log_data: StagingSource,
        song_data: StagingSource,
    ) -> CoreResult<Self> {
        const USER_ID: &str = r#"TRY_CAST(NULLIF(e."userId", '') AS INTEGER)"#;
        const START_TIME: &str = r#"epoch_ms(e."ts")"#;
        const NEXT_SONG: &str = r#"e."page" = 'NextSong'"#;

        let users = Transform::new("e")
            .filter(format!(
                r#"{NEXT_SONG} AND {USER_ID} IS NOT NULL AND e."level" IS NOT NULL"#
            ))
            .project("user_id", USER_ID)
            .project("first_name", r#"e."firstName""#)
            .project("last_name", r#"e."lastName""#)
            .project("gender", r#"e."gender""#)
            .project("level", r#"e."level""#)
            .key(&["user_id"])
            .tie_break(SortKey::desc(r#"e."ts""#))
            .update(&["level"]);

        let songs = Transform::new("s")
            .filter(
                r#"s."song_id" IS NOT NULL AND s."title" IS NOT NULL AND s."artist_id" IS NOT NULL AND s."duration" IS NOT NULL"#,
            )
            .project("song_id", r#"s."song_id""#)
            .project("title", r#"s."title""#)
            .project("artist_id", r#"s."artist_id""#)
            .project("year", r#"COALESCE(s."year", 0)"#)
            .project("duration", r#"s."duration""#)
            .key(&["song_id"]);

        let artists = Transform::new("s")
            .filter(r#"s."artist_id" IS NOT NULL AND s."artist_name" IS NOT NULL"#)
            .project("artist_id", r#"s."artist_id""#)
            .project("name", r#"s."artist_name""#)
            .project("location", r#"s."artist_location""#)
            .project("latitude", r#"s."artist_latitude""#)
            .project("longitude", r#"s."artist_longitude""#)
            .key(&["artist_id"])
            .tie_break(SortKey::asc(r#"s."artist_name""#))
            .tie_break(SortKey::asc(r#"s."artist_location""#));

        let time = Transform::new("e")
            .filter(format!(r#"{NEXT_SONG} AND e."ts" IS NOT NULL"#))
            .project("start_time", START_TIME)
            .project("hour", format!("hour({START_TIME})"))
            .project("day", format!("day({START_TIME})"))
            .project("week", format!("week({START_TIME})"))
            .project("month", format!("month({START_TIME})"))
            .project("year", format!("year({START_TIME})"))
            .project("weekday", format!("dayofweek({START_TIME})"))
            .key(&["start_time"]);

        // Events carry the song denormalized; match them to the catalog on
        // title, artist name, and duration.
        let songplays = Transform::new("e")
            .join(
                "staging_songs",
                "s",
                r#"e."song" = s."title" AND e."artist" = s."artist_name" AND e."length" = s."duration""#,
            )
            .filter(format!(
                r#"{NEXT_SONG} AND {USER_ID} IS NOT NULL AND e."ts" IS NOT NULL"#
            ))
            .project("user_id", USER_ID)
            .project("session_id", r#"e."sessionId""#)
            .project("item_in_session", r#"e."itemInSession""#)
            .project("start_time", START_TIME)
            .project("level", r#"e."level""#)
            .project("song_id", r#"s."song_id""#)
            .project("artist_id", r#"s."artist_id""#)
            .project("location", r#"e."location""#)
            .project("user_agent", r#"e."userAgent""#)
            .key(&["user_id", "session_id", "item_in_session"])
            .tie_break(SortKey::asc(r#"s."song_id""#))
            .tie_break(SortKey::asc(r#"s."artist_id""#))
            .tie_break(SortKey::asc(r#"s."staging_row_id""#));

        Self::new(
            catalog,
            vec![
                LoadEntry::staging("staging_events", log_data),
                LoadEntry::staging("staging_songs", song_data),
                LoadEntry::table("staging_events", "users", users),
                LoadEntry::table("staging_songs", "songs", songs),
                LoadEntry::table("staging_songs", "artists", artists),
                LoadEntry::table("staging_events", "time", time),
                LoadEntry::table("staging_events", "songplays", songplays),
            ],
        )
    }
}

fn invalid(entry: &str, reason: &str) -> CoreError {
    CoreError::InvalidPlan {
        entry: entry.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_transform(
    catalog: &SchemaCatalog,
    target: &TableSpec,
    source: &TableName,
    transform: &Transform,
) -> CoreResult<()> {
    let name = target.name.as_str();
    if target.kind == TableKind::Staging {
        return Err(invalid(name, "staging tables are only filled by bulk copy"));
    }
    if !catalog.get_table_spec(source)?.is_staging() {
        return Err(invalid(name, &format!("source '{}' is not a staging table", source)));
    }

    let mut aliases = HashSet::from([transform.source_alias.as_str()]);
    for join in &transform.joins {
        if !catalog.get_table_spec(&join.table)?.is_staging() {
            return Err(invalid(
                name,
                &format!("joined table '{}' is not a staging table", join.table),
            ));
        }
        if !aliases.insert(join.alias.as_str()) {
            return Err(invalid(name, &format!("alias '{}' is used twice", join.alias)));
        }
    }

    let mut projected = HashSet::new();
    for p in &transform.projection {
        if target.column(&p.column).is_none() {
            return Err(invalid(
                name,
                &format!("projects unknown column '{}'", p.column),
            ));
        }
        if !projected.insert(p.column.as_str()) {
            return Err(invalid(name, &format!("column '{}' projected twice", p.column)));
        }
    }
    for col in &target.columns {
        if !col.nullable && !projected.contains(col.name.as_str()) {
            return Err(invalid(
                name,
                &format!("required column '{}' is not projected", col.name),
            ));
        }
    }

    let key: HashSet<&str> = transform.natural_key.iter().map(|c| c.as_str()).collect();
    let primary: HashSet<&str> = target.primary_key().into_iter().map(|c| c.as_str()).collect();
    if key.is_empty() || key != primary {
        return Err(invalid(
            name,
            "natural key must match the target's primary key",
        ));
    }

    if let UpsertPolicy::InsertOrUpdate { columns } = &transform.policy {
        if columns.is_empty() {
            return Err(invalid(name, "insert-or-update needs at least one column"));
        }
        for col in columns {
            if key.contains(col.as_str()) {
                return Err(invalid(
                    name,
                    &format!("key column '{}' cannot be updated", col),
                ));
            }
            if !projected.contains(col.as_str()) {
                return Err(invalid(
                    name,
                    &format!("updated column '{}' is not projected", col),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod tests;
