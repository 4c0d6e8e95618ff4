//! sl-db - Warehouse abstraction layer for starload
//!
//! This crate provides the `Warehouse`, `BulkLoader`, and `WarehousePool`
//! traits and their DuckDB implementation.

pub mod duckdb;
pub mod error;
pub mod traits;
pub mod value;

pub use crate::duckdb::{DuckDbBackend, DuckDbPool};
pub use error::{DbError, DbResult};
pub use traits::{BulkLoader, Warehouse, WarehousePool};
pub use value::{Row, Value};
