//! Per-table load checkpoints and the run report built from them

use crate::names::TableName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Stage of a load run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Dimensions,
    Facts,
    Verification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Staging => write!(f, "staging"),
            Stage::Dimensions => write!(f, "dimensions"),
            Stage::Facts => write!(f, "facts"),
            Stage::Verification => write!(f, "verification"),
        }
    }
}

/// Row counts captured after one table finished loading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub table: TableName,
    pub stage: Stage,
    /// Rows in the table before this run touched it
    pub rows_before: u64,
    /// Rows in the table after the stage committed
    pub row_count: u64,
    /// Rows offered to the table: copied rows for staging, canonical rows otherwise
    pub source_rows: u64,
    /// Candidate rows dropped because no matching dimension row existed
    pub unmatched: u64,
    pub captured_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Rows this run added to the table
    pub fn rows_added(&self) -> u64 {
        self.row_count.saturating_sub(self.rows_before)
    }
}

/// Summary of a completed load run
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checkpoints: Vec<Checkpoint>,
}

impl LoadReport {
    pub fn checkpoint(&self, table: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.table == table)
    }

    pub fn stage_checkpoints(&self, stage: Stage) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter().filter(move |c| c.stage == stage)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.checkpoints.iter().map(|c| c.unmatched).sum()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
