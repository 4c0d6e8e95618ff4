//! sl-load - Load orchestration for starload
//!
//! Bulk-copies external files into staging relations, derives one
//! canonical row per natural key, upserts dimensions and facts, and drives
//! the whole run through a checked state machine.

pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod staging;
pub mod upsert;

pub use dedup::{dedupe, CanonicalRows};
pub use error::{LoadError, LoadResult, RunFailure};
pub use orchestrator::{CancelToken, LoadOptions, Orchestrator, RunPhase};
pub use retry::RetryPolicy;
pub use staging::{load_staging, truncate};
pub use upsert::{upsert, UpsertOutcome};
