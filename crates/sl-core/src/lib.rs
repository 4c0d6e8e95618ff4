//! sl-core - Core library for starload
//!
//! Shared types for loading a star-schema warehouse: the schema catalog and
//! its dependency DAG, load plans, checkpoints, configuration, and SQL
//! identifier helpers.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod ddl;
pub mod error;
pub mod names;
mod newtype_string;
pub mod plan;
pub mod sql_utils;

pub use catalog::{ColumnSpec, ColumnType, ForeignKey, SchemaCatalog, TableKind, TableSpec};
pub use checkpoint::{Checkpoint, LoadReport, Stage};
pub use config::Config;
pub use dag::TableDag;
pub use error::{CoreError, CoreResult};
pub use names::{ColumnName, TableName};
pub use plan::{
    Join, LoadEntry, LoadPlan, Projection, SortDirection, SortKey, SourceFormat, StagingSource,
    Transform, UpsertPolicy,
};
