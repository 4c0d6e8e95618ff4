//! Schema catalog: static table definitions and their load order.
//!
//! The catalog is built once at startup and shared read-only by every
//! component. Construction validates the definitions and computes the
//! dependency order, so a cyclic or dangling foreign key graph is rejected
//! before any load begins.

use crate::dag::TableDag;
use crate::error::{CoreError, CoreResult};
use crate::names::{ColumnName, TableName};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Semantic column type, rendered to warehouse DDL by [`crate::ddl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    SmallInt,
    Int,
    BigInt,
    Double,
    Varchar(u32),
    Char(u32),
    Timestamp,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::Int => write!(f, "INTEGER"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Varchar(n) => write!(f, "VARCHAR({})", n),
            // Fixed-width text is stored as VARCHAR; the width stays a hint.
            ColumnType::Char(n) => write!(f, "VARCHAR({})", n),
            ColumnType::Timestamp => write!(f, "TIMESTAMP"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// Reference from a column to the key column of another table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub table: TableName,
    pub column: ColumnName,
}

/// One column of a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: ColumnName,
    pub data_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKey>,
}

impl ColumnSpec {
    /// Create a nullable, non-key column
    pub fn new(name: &str, data_type: ColumnType) -> Self {
        Self {
            name: ColumnName::new(name),
            data_type,
            nullable: true,
            primary_key: false,
            references: None,
        }
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column as (part of) the primary key; implies NOT NULL
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Declare a foreign key reference to `table.column`
    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.references = Some(ForeignKey {
            table: TableName::new(table),
            column: ColumnName::new(column),
        });
        self
    }
}

/// Role a table plays in the star schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// Landing table filled verbatim from external files
    Staging,
    /// Descriptive entity, one row per natural key
    Dimension,
    /// Event table referencing dimensions
    Fact,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Staging => write!(f, "staging"),
            TableKind::Dimension => write!(f, "dimension"),
            TableKind::Fact => write!(f, "fact"),
        }
    }
}

/// Immutable definition of a warehouse table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub name: TableName,
    pub kind: TableKind,
    pub columns: Vec<ColumnSpec>,

    /// Distribution key hint; `None` means replicate to all nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_key: Option<ColumnName>,

    /// Sort key hint, most significant first
    pub sort_key: Vec<ColumnName>,

    /// Load-order row identifier (staging tables only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<ColumnName>,
}

impl TableSpec {
    pub fn new(name: &str, kind: TableKind, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: TableName::new(name),
            kind,
            columns,
            dist_key: None,
            sort_key: Vec::new(),
            row_id: None,
        }
    }

    /// Staging table with a generated load-order row identifier
    pub fn staging(name: &str, row_id: &str, columns: Vec<ColumnSpec>) -> Self {
        let mut all = vec![ColumnSpec::new(row_id, ColumnType::BigInt).not_null()];
        all.extend(columns);
        Self {
            row_id: Some(ColumnName::new(row_id)),
            ..Self::new(name, TableKind::Staging, all)
        }
    }

    pub fn with_dist_key(mut self, column: &str) -> Self {
        self.dist_key = Some(ColumnName::new(column));
        self
    }

    pub fn with_sort_key(mut self, columns: &[&str]) -> Self {
        self.sort_key = columns.iter().map(|c| ColumnName::new(*c)).collect();
        self
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns in declaration order
    pub fn primary_key(&self) -> Vec<&ColumnName> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| &c.name)
            .collect()
    }

    /// Columns carrying a foreign key reference
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&ColumnSpec, &ForeignKey)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|fk| (c, fk)))
    }

    /// Columns an external file supplies (everything except the row identifier)
    pub fn loadable_columns(&self) -> Vec<&ColumnName> {
        self.columns
            .iter()
            .filter(|c| Some(&c.name) != self.row_id.as_ref())
            .map(|c| &c.name)
            .collect()
    }

    pub fn is_staging(&self) -> bool {
        self.kind == TableKind::Staging
    }

    /// Tables this one must be loaded after
    fn dependencies<'a>(&'a self, staging: &'a [TableName]) -> Vec<&'a TableName> {
        if self.is_staging() {
            return Vec::new();
        }
        // Warehouse tables are filled from staging, so every staging table
        // precedes them even without a declared reference.
        let mut deps: Vec<&TableName> = staging.iter().collect();
        for (_, fk) in self.foreign_keys() {
            if fk.table != self.name && !deps.contains(&&fk.table) {
                deps.push(&fk.table);
            }
        }
        deps
    }
}

/// Validated set of table definitions with a fixed dependency order
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableSpec>,
    index: HashMap<TableName, usize>,
    order: Vec<usize>,
}

impl SchemaCatalog {
    /// Build and validate a catalog.
    ///
    /// Fails with `InvalidCatalog` on duplicate names, dangling references,
    /// or staging tables taking part in foreign keys, and with
    /// `DependencyCycle` when the reference graph is not acyclic.
    pub fn new(tables: Vec<TableSpec>) -> CoreResult<Self> {
        let mut index = HashMap::new();
        for (i, spec) in tables.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(CoreError::InvalidCatalog {
                    message: format!("duplicate table '{}'", spec.name),
                });
            }
            Self::validate_columns(spec)?;
        }

        for spec in &tables {
            for (col, fk) in spec.foreign_keys() {
                let target = index
                    .get(fk.table.as_str())
                    .map(|&i| &tables[i])
                    .ok_or_else(|| CoreError::InvalidCatalog {
                        message: format!(
                            "{}.{} references unknown table '{}'",
                            spec.name, col.name, fk.table
                        ),
                    })?;
                if spec.is_staging() || target.is_staging() {
                    return Err(CoreError::InvalidCatalog {
                        message: format!(
                            "{}.{}: staging tables cannot take part in foreign keys",
                            spec.name, col.name
                        ),
                    });
                }
                if target.column(&fk.column).is_none() {
                    return Err(CoreError::InvalidCatalog {
                        message: format!(
                            "{}.{} references missing column {}.{}",
                            spec.name, col.name, fk.table, fk.column
                        ),
                    });
                }
            }
        }

        let staging: Vec<TableName> = tables
            .iter()
            .filter(|t| t.is_staging())
            .map(|t| t.name.clone())
            .collect();
        let mut dag = TableDag::new();
        for spec in &tables {
            dag.add_table(&spec.name);
        }
        for spec in &tables {
            for dep in spec.dependencies(&staging) {
                dag.add_dependency(&spec.name, dep);
            }
        }
        let order = dag
            .topological_order()?
            .iter()
            .map(|name| index[name])
            .collect();

        Ok(Self {
            tables,
            index,
            order,
        })
    }

    fn validate_columns(spec: &TableSpec) -> CoreResult<()> {
        let mut seen = HashSet::new();
        for col in &spec.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(CoreError::InvalidCatalog {
                    message: format!("duplicate column {}.{}", spec.name, col.name),
                });
            }
        }
        match (spec.kind, &spec.row_id) {
            (TableKind::Staging, Some(row_id)) if spec.column(row_id).is_none() => {
                Err(CoreError::InvalidCatalog {
                    message: format!("row id column {}.{} is not defined", spec.name, row_id),
                })
            }
            (TableKind::Staging, None) => Err(CoreError::InvalidCatalog {
                message: format!("staging table '{}' needs a row id column", spec.name),
            }),
            (TableKind::Dimension | TableKind::Fact, _) if spec.primary_key().is_empty() => {
                Err(CoreError::InvalidCatalog {
                    message: format!("table '{}' has no natural key", spec.name),
                })
            }
            _ => Ok(()),
        }
    }

    /// Look up a table definition by name
    pub fn get_table_spec(&self, name: &str) -> CoreResult<&TableSpec> {
        self.index
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| CoreError::UnknownTable {
                name: name.to_string(),
            })
    }

    /// Tables in load order: every referenced table precedes its referrers
    pub fn dependency_order(&self) -> Vec<&TableSpec> {
        self.order.iter().map(|&i| &self.tables[i]).collect()
    }

    /// Tables of one kind, in load order
    pub fn tables_of_kind(&self, kind: TableKind) -> Vec<&TableSpec> {
        self.dependency_order()
            .into_iter()
            .filter(|t| t.kind == kind)
            .collect()
    }

    /// Whether `table` declares a foreign key to `referenced`
    pub fn references(&self, table: &str, referenced: &str) -> bool {
        self.get_table_spec(table)
            .map(|spec| spec.foreign_keys().any(|(_, fk)| fk.table == referenced))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The Sparkify song-play warehouse
    pub fn sparkify() -> CoreResult<Self> {
        use ColumnType::*;

        let staging_events = TableSpec::staging(
            "staging_events",
            "staging_row_id",
            vec![
                ColumnSpec::new("artist", Varchar(256)),
                ColumnSpec::new("auth", Varchar(256)),
                ColumnSpec::new("firstName", Varchar(256)),
                ColumnSpec::new("gender", Char(1)),
                ColumnSpec::new("itemInSession", Int),
                ColumnSpec::new("lastName", Varchar(256)),
                ColumnSpec::new("length", Double),
                ColumnSpec::new("level", Varchar(10)),
                ColumnSpec::new("location", Varchar(256)),
                ColumnSpec::new("method", Varchar(20)),
                ColumnSpec::new("page", Varchar(256)),
                ColumnSpec::new("registration", Double),
                ColumnSpec::new("sessionId", Int),
                ColumnSpec::new("song", Varchar(256)),
                ColumnSpec::new("status", SmallInt),
                ColumnSpec::new("ts", BigInt),
                ColumnSpec::new("userAgent", Varchar(256)),
                // Logged-out events carry an empty string here.
                ColumnSpec::new("userId", Varchar(32)),
            ],
        );

        let staging_songs = TableSpec::staging(
            "staging_songs",
            "staging_row_id",
            vec![
                ColumnSpec::new("num_songs", Int),
                ColumnSpec::new("artist_id", Varchar(256)),
                ColumnSpec::new("artist_latitude", Double),
                ColumnSpec::new("artist_longitude", Double),
                ColumnSpec::new("artist_location", Varchar(256)),
                ColumnSpec::new("artist_name", Varchar(256)),
                ColumnSpec::new("song_id", Varchar(256)),
                ColumnSpec::new("title", Varchar(256)),
                ColumnSpec::new("duration", Double),
                ColumnSpec::new("year", Int),
            ],
        );

        let users = TableSpec::new(
            "users",
            TableKind::Dimension,
            vec![
                ColumnSpec::new("user_id", Int).primary_key(),
                ColumnSpec::new("first_name", Varchar(256)),
                ColumnSpec::new("last_name", Varchar(256)),
                ColumnSpec::new("gender", Char(1)),
                ColumnSpec::new("level", Varchar(10)).not_null(),
            ],
        )
        .with_sort_key(&["level", "gender", "first_name", "last_name"]);

        let songs = TableSpec::new(
            "songs",
            TableKind::Dimension,
            vec![
                ColumnSpec::new("song_id", Varchar(20)).primary_key(),
                ColumnSpec::new("title", Varchar(256)).not_null(),
                ColumnSpec::new("artist_id", Varchar(20)).not_null(),
                ColumnSpec::new("year", SmallInt).not_null(),
                ColumnSpec::new("duration", Double).not_null(),
            ],
        )
        .with_sort_key(&["year", "title", "duration"]);

        let artists = TableSpec::new(
            "artists",
            TableKind::Dimension,
            vec![
                ColumnSpec::new("artist_id", Varchar(20)).primary_key(),
                ColumnSpec::new("name", Varchar(256)).not_null(),
                ColumnSpec::new("location", Varchar(256)),
                ColumnSpec::new("latitude", Double),
                ColumnSpec::new("longitude", Double),
            ],
        )
        .with_sort_key(&["name", "location"]);

        let time = TableSpec::new(
            "time",
            TableKind::Dimension,
            vec![
                ColumnSpec::new("start_time", Timestamp).primary_key(),
                ColumnSpec::new("hour", SmallInt).not_null(),
                ColumnSpec::new("day", SmallInt).not_null(),
                ColumnSpec::new("week", SmallInt).not_null(),
                ColumnSpec::new("month", SmallInt).not_null(),
                ColumnSpec::new("year", SmallInt).not_null(),
                ColumnSpec::new("weekday", SmallInt).not_null(),
            ],
        )
        .with_dist_key("start_time")
        .with_sort_key(&["year", "month", "day"]);

        let songplays = TableSpec::new(
            "songplays",
            TableKind::Fact,
            vec![
                ColumnSpec::new("user_id", Int)
                    .primary_key()
                    .references("users", "user_id"),
                ColumnSpec::new("session_id", Int).primary_key(),
                ColumnSpec::new("item_in_session", Int).primary_key(),
                ColumnSpec::new("start_time", Timestamp)
                    .not_null()
                    .references("time", "start_time"),
                ColumnSpec::new("level", Varchar(10)),
                ColumnSpec::new("song_id", Varchar(20))
                    .not_null()
                    .references("songs", "song_id"),
                ColumnSpec::new("artist_id", Varchar(20))
                    .not_null()
                    .references("artists", "artist_id"),
                ColumnSpec::new("location", Varchar(256)),
                ColumnSpec::new("user_agent", Varchar(256)),
            ],
        )
        .with_dist_key("start_time")
        .with_sort_key(&["level", "start_time"]);

        Self::new(vec![
            staging_events,
            staging_songs,
            songplays,
            users,
            songs,
            artists,
            time,
        ])
    }
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod tests;
