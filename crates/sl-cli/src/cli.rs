//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand, ValueEnum};
use sl_core::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

/// starload - load the Sparkify star schema from event logs and a song catalog
#[derive(Parser, Debug)]
#[command(name = "starload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file
    #[arg(
        short,
        long,
        global = true,
        env = "STARLOAD_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the staging, dimension and fact tables
    Setup(SetupArgs),

    /// Show table dependency order and the load plan
    Plan(PlanArgs),

    /// Run a load: staging, dimensions, facts, verification
    Load(LoadArgs),
}

/// Arguments for the setup command
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Drop existing tables before creating them
    #[arg(long)]
    pub drop: bool,
}

/// Arguments for the plan command
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the load command
#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Load dimension tables concurrently (overrides the config file)
    #[arg(long)]
    pub parallel: bool,
}

/// Report output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table
    Text,
    /// JSON document on stdout
    Json,
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;
