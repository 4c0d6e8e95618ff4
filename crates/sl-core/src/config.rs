//! Configuration types and parsing for starload.yml

use crate::error::{CoreError, CoreResult};
use crate::plan::StagingSource;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "starload.yml";

/// Main configuration from starload.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Warehouse name, used in log output
    pub name: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// External locations bulk-copied into staging
    pub sources: SourcesConfig,

    #[serde(default)]
    pub load: LoadSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database file path, or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Event log and song catalog locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    pub log_data: StagingSource,
    pub song_data: StagingSource,
}

/// Load run behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadSettings {
    /// Upper bound on a single bulk copy, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Load dimension tables concurrently
    #[serde(default)]
    pub parallel_dimensions: bool,

    /// Keep staging relations after a successful run
    #[serde(default = "default_true")]
    pub keep_staging: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            parallel_dimensions: false,
            keep_staging: true,
        }
    }
}

impl LoadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry policy for transient staging failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_db_path() -> String {
    ":memory:".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_yaml(content: &str) -> CoreResult<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path cannot be empty"));
        }
        for (key, source) in [
            ("log_data", &self.sources.log_data),
            ("song_data", &self.sources.song_data),
        ] {
            if source.uri.trim().is_empty() {
                return Err(invalid(&format!("sources.{key}.uri cannot be empty")));
            }
            if matches!(&source.credential_ref, Some(r) if r.trim().is_empty()) {
                return Err(invalid(&format!(
                    "sources.{key}.credential_ref cannot be empty when set"
                )));
            }
        }
        if self.load.timeout_secs == 0 {
            return Err(invalid("load.timeout_secs must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms cannot exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CoreError {
    CoreError::ConfigInvalid {
        message: message.to_string(),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
