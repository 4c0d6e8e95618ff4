//! Error types for sl-core

use thiserror::Error;

/// Core error type for starload
#[derive(Error, Debug)]
pub enum CoreError {
    /// C001: Table is not part of the schema catalog
    #[error("[C001] Unknown table: {name}")]
    UnknownTable { name: String },

    /// C002: Foreign key graph contains a cycle
    #[error("[C002] Dependency cycle detected: {cycle}")]
    DependencyCycle { cycle: String },

    /// C003: Catalog definition is inconsistent
    #[error("[C003] Invalid catalog: {message}")]
    InvalidCatalog { message: String },

    /// C004: Load plan does not agree with the catalog
    #[error("[C004] Invalid load plan entry '{entry}': {reason}")]
    InvalidPlan { entry: String, reason: String },

    /// C005: Configuration file not found
    #[error("[C005] Config file not found: {path}")]
    ConfigNotFound { path: String },

    /// C006: Invalid configuration value
    #[error("[C006] Invalid config: {message}")]
    ConfigInvalid { message: String },

    /// C007: IO error with file path context
    #[error("[C007] Failed to read '{path}': {source}")]
    IoWithPath {
        path: String,
        source: std::io::Error,
    },

    /// C008: YAML parse error
    #[error("[C008] Config parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for CoreError
pub type CoreResult<T> = Result<T, CoreError>;
