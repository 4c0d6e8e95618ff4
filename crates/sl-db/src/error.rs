//! Error types for sl-db

use thiserror::Error;

/// Warehouse operation errors
#[derive(Error, Debug)]
pub enum DbError {
    /// Connection error (D001)
    #[error("[D001] Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error (D002)
    #[error("[D002] SQL execution failed: {0}")]
    ExecutionError(String),

    /// Table not found (D003)
    #[error("[D003] Table or view not found: {0}")]
    TableNotFound(String),

    /// External source missing or unreadable (D004)
    #[error("[D004] Source unreachable: {0}")]
    SourceUnreachable(String),

    /// Source rows do not fit the target columns (D005)
    #[error("[D005] Source does not match target schema: {0}")]
    SchemaMismatch(String),

    /// NOT NULL, key, or CHECK constraint rejected a row (D006)
    #[error("[D006] Constraint violation: {0}")]
    ConstraintViolation(String),

    /// BEGIN/COMMIT/ROLLBACK failed (D007)
    #[error("[D007] Transaction failed: {0}")]
    TransactionError(String),

    /// Mutex poisoned (D008)
    #[error("[D008] Database mutex poisoned: {0}")]
    MutexPoisoned(String),

    /// Internal error (D009)
    #[error("[D009] Internal database error: {0}")]
    Internal(String),
}

/// Result type alias for DbError
pub type DbResult<T> = Result<T, DbError>;

impl From<duckdb::Error> for DbError {
    fn from(err: duckdb::Error) -> Self {
        // duckdb::Error does not expose structured variants; classify by
        // the error class prefix DuckDB puts in the message.
        let msg = err.to_string();
        if msg.contains("Table with name")
            || msg.contains("View with name")
            || msg.contains("Table or view with name")
            || (msg.contains("Catalog Error") && msg.contains("Table") && msg.contains("not found"))
        {
            DbError::TableNotFound(msg)
        } else if msg.contains("No files found")
            || msg.contains("Cannot open file")
            || msg.contains("IO Error")
            || msg.contains("HTTP Error")
        {
            DbError::SourceUnreachable(msg)
        } else if msg.contains("Constraint Error") {
            DbError::ConstraintViolation(msg)
        } else if msg.contains("Conversion Error")
            || msg.contains("Malformed JSON")
            || msg.contains("Invalid Input Error")
            || (msg.contains("Binder Error") && msg.contains("not found"))
        {
            DbError::SchemaMismatch(msg)
        } else if msg.contains("TransactionContext Error") {
            DbError::TransactionError(msg)
        } else {
            DbError::ExecutionError(msg)
        }
    }
}
