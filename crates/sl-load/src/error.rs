//! Error types for sl-load

use sl_core::{Checkpoint, CoreError, Stage};
use sl_db::DbError;
use thiserror::Error;

/// Errors raised while loading one table
#[derive(Error, Debug)]
pub enum LoadError {
    /// L001: External source missing, unreadable, or missing its credential
    #[error("[L001] Source unreachable for '{table}': {message}")]
    SourceUnreachable { table: String, message: String },

    /// L002: Source records do not fit the staging relation
    #[error("[L002] Schema mismatch loading '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    /// L003: Bulk copy exceeded the configured timeout
    #[error("[L003] Bulk copy into '{table}' exceeded {timeout_secs}s")]
    LoadTimeout { table: String, timeout_secs: u64 },

    /// L004: A canonical row was rejected by the target
    #[error("[L004] Constraint violation in '{table}': {message}")]
    ConstraintViolation { table: String, message: String },

    /// L005: Target table missing or its session failed
    #[error("[L005] Target '{table}' unavailable: {message}")]
    TargetUnavailable { table: String, message: String },

    /// L006: Catalog or plan lookup failed
    #[error("[L006] {0}")]
    Catalog(#[from] CoreError),

    /// L007: A table grew by more rows than were offered to it
    #[error(
        "[L007] Verification failed for '{table}': {rows_added} rows added but only {source_rows} offered"
    )]
    VerificationFailed {
        table: String,
        rows_added: u64,
        source_rows: u64,
    },

    /// L008: The run was cancelled
    #[error("[L008] Load cancelled")]
    Cancelled,

    /// L009: Any other warehouse error
    #[error("[L009] {0}")]
    Database(#[from] DbError),

    /// L010: Run state machine was driven out of order
    #[error("[L010] Invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// L011: A table was offered more rows than its staging relation holds
    #[error(
        "[L011] Verification failed for '{table}': {rows} rows derived from '{staging}', which holds only {staged_rows}"
    )]
    ExceedsStaging {
        table: String,
        staging: String,
        rows: u64,
        staged_rows: u64,
    },
}

/// Result type alias for LoadError
pub type LoadResult<T> = Result<T, LoadError>;

impl LoadError {
    /// Transient failures worth retrying after truncating staging
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadError::SourceUnreachable { .. } | LoadError::LoadTimeout { .. }
        )
    }

    /// Classify a warehouse error raised while bulk-copying into staging
    pub(crate) fn staging(table: &str, err: DbError) -> Self {
        let table = table.to_string();
        match err {
            DbError::SourceUnreachable(message) => LoadError::SourceUnreachable { table, message },
            DbError::SchemaMismatch(message) | DbError::ConstraintViolation(message) => {
                LoadError::SchemaMismatch { table, message }
            }
            DbError::TableNotFound(message)
            | DbError::ConnectionError(message)
            | DbError::MutexPoisoned(message) => LoadError::TargetUnavailable { table, message },
            other => LoadError::Database(other),
        }
    }

    /// Classify a warehouse error raised while writing a dimension or fact
    pub(crate) fn upsert(table: &str, err: DbError) -> Self {
        let table = table.to_string();
        match err {
            DbError::ConstraintViolation(message) | DbError::SchemaMismatch(message) => {
                LoadError::ConstraintViolation { table, message }
            }
            DbError::TableNotFound(message)
            | DbError::ConnectionError(message)
            | DbError::MutexPoisoned(message) => LoadError::TargetUnavailable { table, message },
            other => LoadError::Database(other),
        }
    }
}

/// A run that stopped before `Done`.
///
/// Checkpoints of stages that committed before the failure are kept; they
/// are not rolled back.
#[derive(Error, Debug)]
#[error("load run {run_id} failed during {stage}: {reason}")]
pub struct RunFailure {
    pub run_id: String,
    pub stage: Stage,
    #[source]
    pub reason: LoadError,
    pub checkpoints: Vec<Checkpoint>,
}
