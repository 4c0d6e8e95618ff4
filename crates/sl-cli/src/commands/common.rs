//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use serde::Serialize;
use sl_core::{Config, LoadPlan, SchemaCatalog};
use std::fmt;

use crate::cli::GlobalArgs;

/// Error type representing a non-zero process exit code.
///
/// Commands return `Err(ExitCode(N).into())` after printing their own
/// report, so `main` exits without printing anything further.
#[derive(Debug)]
pub(crate) struct ExitCode(pub(crate) i32);

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "")
    }
}

impl std::error::Error for ExitCode {}

/// Outcome of a load run as reported on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RunStatus {
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

pub(crate) fn load_config(global: &GlobalArgs) -> Result<Config> {
    Config::load(&global.config)
        .with_context(|| format!("Failed to load config from {}", global.config.display()))
}

pub(crate) fn load_catalog() -> Result<SchemaCatalog> {
    SchemaCatalog::sparkify().context("Failed to build schema catalog")
}

/// The Sparkify load plan over the configured sources
pub(crate) fn build_plan(config: &Config, catalog: &SchemaCatalog) -> Result<LoadPlan> {
    LoadPlan::sparkify(
        catalog,
        config.sources.log_data.clone(),
        config.sources.song_data.clone(),
    )
    .context("Failed to build load plan")
}
