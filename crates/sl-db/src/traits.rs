//! Warehouse trait definitions

use crate::error::DbResult;
use crate::value::Row;
use async_trait::async_trait;
use sl_core::SourceFormat;

/// A session on the warehouse.
///
/// Implementations must be Send + Sync for async operation. Transactions
/// are scoped to the session: one `begin_transaction` per `commit` or
/// `rollback`.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute SQL that modifies data, returns affected rows
    async fn execute(&self, sql: &str) -> DbResult<usize>;

    /// Execute multiple SQL statements
    async fn execute_batch(&self, sql: &str) -> DbResult<()>;

    /// Run a query and collect every row
    async fn query(&self, sql: &str) -> DbResult<Vec<Row>>;

    /// Count the rows a query returns
    async fn query_count(&self, sql: &str) -> DbResult<u64>;

    async fn begin_transaction(&self) -> DbResult<()>;

    async fn commit(&self) -> DbResult<()>;

    async fn rollback(&self) -> DbResult<()>;

    /// Check if a table or view exists
    async fn relation_exists(&self, name: &str) -> DbResult<bool>;

    /// Column names of a relation, in ordinal order
    async fn table_columns(&self, name: &str) -> DbResult<Vec<String>>;

    /// Database type identifier for logging
    fn db_type(&self) -> &'static str;
}

/// Bulk copy from an external location into a staging relation
#[async_trait]
pub trait BulkLoader: Warehouse {
    /// Append every record at `source_uri` to `target`, reading only
    /// `columns`, and return the number of rows copied.
    ///
    /// A `credential_ref` names a credential already registered with the
    /// warehouse; a missing one is reported as an unreachable source.
    async fn bulk_copy(
        &self,
        source_uri: &str,
        target: &str,
        columns: &[String],
        format: SourceFormat,
        credential_ref: Option<&str>,
    ) -> DbResult<u64>;
}

/// Hands out independent warehouse sessions
#[async_trait]
pub trait WarehousePool: Send + Sync {
    async fn connection(&self) -> DbResult<Box<dyn BulkLoader>>;
}
