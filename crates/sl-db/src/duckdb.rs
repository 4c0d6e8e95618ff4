//! DuckDB warehouse backend implementation

use crate::error::{DbError, DbResult};
use crate::traits::{BulkLoader, Warehouse, WarehousePool};
use crate::value::{Row, Value};
use async_trait::async_trait;
use duckdb::types::Value as DuckValue;
use duckdb::Connection;
use sl_core::sql_utils::{quote_ident, quote_literal, split_qualified_name};
use sl_core::SourceFormat;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// DuckDB warehouse session
///
/// Calls run on the blocking thread pool so a caller can bound them with
/// `tokio::time::timeout`.
pub struct DuckDbBackend {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Create a new in-memory DuckDB connection
    pub fn in_memory() -> DbResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Create a new DuckDB connection from a file path
    pub fn from_path(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path).map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Create from path string (handles :memory: special case)
    pub fn new(path: &str) -> DbResult<Self> {
        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::from_path(Path::new(path))
        }
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Open another session on the same database
    pub fn try_clone(&self) -> DbResult<Self> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))?;
        let cloned = conn
            .try_clone()
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self::from_connection(cloned))
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| DbError::MutexPoisoned(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| DbError::Internal(format!("blocking task failed: {e}")))?
    }
}

fn execute_sync(conn: &Connection, sql: &str) -> DbResult<usize> {
    log::trace!("execute: {sql}");
    Ok(conn.execute(sql, [])?)
}

fn query_sync(conn: &Connection, sql: &str) -> DbResult<Vec<Row>> {
    log::trace!("query: {sql}");
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            let col_count = row.as_ref().column_count();
            Ok((0..col_count).map(|i| read_value(row, i)).collect())
        })?
        .collect::<Result<Vec<Row>, _>>()?;
    Ok(rows)
}

fn query_count_sync(conn: &Connection, sql: &str) -> DbResult<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM ({})", sql), [], |row| {
        row.get(0)
    })?;
    u64::try_from(count).map_err(|e| DbError::Internal(format!("negative count: {e}")))
}

/// Column names and declared types of a relation, in ordinal order
fn column_types_sync(conn: &Connection, name: &str) -> DbResult<Vec<(String, String)>> {
    let (schema, table) = split_qualified_name(name);
    let sql = format!(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
        quote_literal(schema),
        quote_literal(table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(DbError::TableNotFound(name.to_string()));
    }
    Ok(columns)
}

/// Read a column value, widening integers and floats.
///
/// Types without a counterpart in [`Value`] (timestamps, decimals, nested
/// types) fall back to their text rendering.
fn read_value(row: &duckdb::Row<'_>, idx: usize) -> Value {
    match row.get::<_, DuckValue>(idx) {
        Ok(DuckValue::Null) => Value::Null,
        Ok(DuckValue::Boolean(b)) => Value::Bool(b),
        Ok(DuckValue::TinyInt(n)) => Value::Int(n.into()),
        Ok(DuckValue::SmallInt(n)) => Value::Int(n.into()),
        Ok(DuckValue::Int(n)) => Value::Int(n.into()),
        Ok(DuckValue::BigInt(n)) => Value::Int(n),
        Ok(DuckValue::UTinyInt(n)) => Value::Int(n.into()),
        Ok(DuckValue::USmallInt(n)) => Value::Int(n.into()),
        Ok(DuckValue::UInt(n)) => Value::Int(n.into()),
        Ok(DuckValue::Float(f)) => Value::Float(f.into()),
        Ok(DuckValue::Double(f)) => Value::Float(f),
        Ok(DuckValue::Text(s)) => Value::Text(s),
        Ok(other) => Value::Text(format!("{other:?}")),
        Err(_) => match row.get::<_, Option<String>>(idx) {
            Ok(Some(s)) => Value::Text(s),
            _ => Value::Null,
        },
    }
}

fn reader_sql(
    source_uri: &str,
    format: SourceFormat,
    columns: &[String],
    types: &[(String, String)],
) -> DbResult<String> {
    match format {
        SourceFormat::Json => {
            let mut fields = Vec::with_capacity(columns.len());
            for col in columns {
                let data_type = types
                    .iter()
                    .find(|(name, _)| name == col)
                    .map(|(_, t)| t.as_str())
                    .ok_or_else(|| {
                        DbError::SchemaMismatch(format!("target has no column '{col}'"))
                    })?;
                fields.push(format!("{}: {}", quote_literal(col), quote_literal(data_type)));
            }
            Ok(format!(
                "read_json({}, format = 'auto', columns = {{{}}})",
                quote_literal(source_uri),
                fields.join(", ")
            ))
        }
        SourceFormat::Csv => Ok(format!(
            "read_csv_auto({}, header = true)",
            quote_literal(source_uri)
        )),
    }
}

fn bulk_copy_sync(
    conn: &Connection,
    source_uri: &str,
    target: &str,
    columns: &[String],
    format: SourceFormat,
    credential_ref: Option<&str>,
) -> DbResult<u64> {
    if let Some(name) = credential_ref {
        let registered = query_count_sync(
            conn,
            &format!(
                "SELECT 1 FROM duckdb_secrets() WHERE name = {}",
                quote_literal(name)
            ),
        )?;
        if registered == 0 {
            return Err(DbError::SourceUnreachable(format!(
                "credential '{name}' is not registered"
            )));
        }
    }

    let types = column_types_sync(conn, target)?;
    let reader = reader_sql(source_uri, format, columns, &types)?;
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_ident(target),
        column_list,
        column_list,
        reader
    );
    let copied = execute_sync(conn, &sql)?;
    Ok(copied as u64)
}

#[async_trait]
impl Warehouse for DuckDbBackend {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| execute_sync(conn, &sql)).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            log::trace!("execute_batch: {sql}");
            Ok(conn.execute_batch(&sql)?)
        })
        .await
    }

    async fn query(&self, sql: &str) -> DbResult<Vec<Row>> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_sync(conn, &sql)).await
    }

    async fn query_count(&self, sql: &str) -> DbResult<u64> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_count_sync(conn, &sql)).await
    }

    async fn begin_transaction(&self) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN TRANSACTION")
                .map_err(|e| DbError::TransactionError(format!("BEGIN failed: {e}")))
        })
        .await
    }

    async fn commit(&self) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("COMMIT")
                .map_err(|e| DbError::TransactionError(format!("COMMIT failed: {e}")))
        })
        .await
    }

    async fn rollback(&self) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("ROLLBACK")
                .map_err(|e| DbError::TransactionError(format!("ROLLBACK failed: {e}")))
        })
        .await
    }

    async fn relation_exists(&self, name: &str) -> DbResult<bool> {
        let (schema, table) = split_qualified_name(name);
        let sql = format!(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = {} AND table_name = {}",
            quote_literal(schema),
            quote_literal(table)
        );
        Ok(self.query_count(&sql).await? > 0)
    }

    async fn table_columns(&self, name: &str) -> DbResult<Vec<String>> {
        let name = name.to_string();
        let columns = self
            .with_conn(move |conn| column_types_sync(conn, &name))
            .await?;
        Ok(columns.into_iter().map(|(name, _)| name).collect())
    }

    fn db_type(&self) -> &'static str {
        "duckdb"
    }
}

#[async_trait]
impl BulkLoader for DuckDbBackend {
    async fn bulk_copy(
        &self,
        source_uri: &str,
        target: &str,
        columns: &[String],
        format: SourceFormat,
        credential_ref: Option<&str>,
    ) -> DbResult<u64> {
        let source_uri = source_uri.to_string();
        let target = target.to_string();
        let columns = columns.to_vec();
        let credential_ref = credential_ref.map(str::to_string);
        self.with_conn(move |conn| {
            bulk_copy_sync(
                conn,
                &source_uri,
                &target,
                &columns,
                format,
                credential_ref.as_deref(),
            )
        })
        .await
    }
}

/// Pool of DuckDB sessions sharing one database
pub struct DuckDbPool {
    root: DuckDbBackend,
}

impl DuckDbPool {
    /// Open the database at `path` (or `:memory:`)
    pub fn new(path: &str) -> DbResult<Self> {
        Ok(Self {
            root: DuckDbBackend::new(path)?,
        })
    }

    pub fn in_memory() -> DbResult<Self> {
        Ok(Self {
            root: DuckDbBackend::in_memory()?,
        })
    }

    /// The session the pool was opened with, for setup and inspection
    pub fn root(&self) -> &DuckDbBackend {
        &self.root
    }
}

#[async_trait]
impl WarehousePool for DuckDbPool {
    async fn connection(&self) -> DbResult<Box<dyn BulkLoader>> {
        Ok(Box::new(self.root.try_clone()?))
    }
}

#[cfg(test)]
#[path = "duckdb_test.rs"]
mod tests;
