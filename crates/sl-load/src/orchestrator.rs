//! Load Orchestrator: drives a load plan through staging, dimensions, facts,
//! and verification.
//!
//! Every entry runs in its own transaction on its own pooled session. A
//! failure stops the run in the stage where it happened; stages that
//! already committed stay committed and their checkpoints are returned
//! with the failure.

use crate::dedup::dedupe;
use crate::error::{LoadError, LoadResult, RunFailure};
use crate::retry::RetryPolicy;
use crate::staging::{count_rows, load_staging, truncate};
use crate::upsert::upsert;
use chrono::Utc;
use futures::future::join_all;
use sl_core::{
    ddl, Checkpoint, Config, LoadEntry, LoadPlan, LoadReport, SchemaCatalog, Stage, TableKind,
    TableName,
};
use sl_db::{BulkLoader, WarehousePool};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Lifecycle of a load run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    StagingInProgress,
    DimensionsInProgress,
    FactsInProgress,
    Verified,
    Done,
    Failed(Stage),
}

impl RunPhase {
    /// Whether the run may move from this phase to `next`
    pub fn can_transition_to(&self, next: &RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Idle, StagingInProgress)
            | (StagingInProgress, DimensionsInProgress)
            | (DimensionsInProgress, FactsInProgress)
            | (FactsInProgress, Verified)
            | (Verified, Done) => true,
            (StagingInProgress, Failed(Stage::Staging))
            | (DimensionsInProgress, Failed(Stage::Dimensions))
            | (FactsInProgress, Failed(Stage::Facts))
            | (FactsInProgress, Failed(Stage::Verification))
            | (Verified, Failed(Stage::Verification)) => true,
            _ => false,
        }
    }

    /// The stage work in this phase belongs to
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunPhase::StagingInProgress => Some(Stage::Staging),
            RunPhase::DimensionsInProgress => Some(Stage::Dimensions),
            RunPhase::FactsInProgress => Some(Stage::Facts),
            RunPhase::Failed(stage) => Some(*stage),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed(_))
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::StagingInProgress => write!(f, "staging"),
            RunPhase::DimensionsInProgress => write!(f, "dimensions"),
            RunPhase::FactsInProgress => write!(f, "facts"),
            RunPhase::Verified => write!(f, "verified"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}

/// Cooperative cancellation flag shared with the caller.
///
/// Checked between stages, between entries, and between staging retries,
/// never inside a transaction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Run-level settings
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Bound on a single bulk copy
    pub timeout: Duration,
    pub parallel_dimensions: bool,
    pub keep_staging: bool,
    pub retry: RetryPolicy,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            parallel_dimensions: false,
            keep_staging: true,
            retry: RetryPolicy::none(),
        }
    }
}

impl LoadOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.load.timeout(),
            parallel_dimensions: config.load.parallel_dimensions,
            keep_staging: config.load.keep_staging,
            retry: RetryPolicy::from_settings(&config.retry),
        }
    }
}

/// Phase and checkpoints of the run in progress
struct RunTracker {
    run_id: String,
    phase: RunPhase,
    checkpoints: Vec<Checkpoint>,
}

impl RunTracker {
    fn advance(&mut self, next: RunPhase) -> LoadResult<()> {
        if !self.phase.can_transition_to(&next) {
            return Err(LoadError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("Run {}: {} -> {}", self.run_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn fail(&mut self, stage: Stage, reason: LoadError) -> RunFailure {
        let failed = RunPhase::Failed(stage);
        if !self.phase.can_transition_to(&failed) {
            log::warn!("Run {}: forcing {} -> {}", self.run_id, self.phase, failed);
        }
        self.phase = failed;
        log::error!("Run {} failed during {stage}: {reason}", self.run_id);
        RunFailure {
            run_id: self.run_id.clone(),
            stage,
            reason,
            checkpoints: std::mem::take(&mut self.checkpoints),
        }
    }
}

/// Executes load plans against a warehouse pool
pub struct Orchestrator<'a> {
    pool: &'a dyn WarehousePool,
    catalog: &'a SchemaCatalog,
    options: LoadOptions,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(pool: &'a dyn WarehousePool, catalog: &'a SchemaCatalog, options: LoadOptions) -> Self {
        Self {
            pool,
            catalog,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Use a caller-owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every entry of `plan`: staging, then dimensions, then facts,
    /// then verification.
    pub async fn run_load(&self, plan: &LoadPlan) -> Result<LoadReport, RunFailure> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut run = RunTracker {
            run_id: uuid::Uuid::new_v4().to_string(),
            phase: RunPhase::Idle,
            checkpoints: Vec::new(),
        };
        log::info!("Starting load run {} ({} entries)", run.run_id, plan.len());

        // Staging
        if let Err(e) = run.advance(RunPhase::StagingInProgress) {
            return Err(run.fail(Stage::Staging, e));
        }
        for entry in plan.staging_entries() {
            if let Err(e) = self.check_cancelled() {
                return Err(run.fail(Stage::Staging, e));
            }
            match self.load_staging_entry(entry).await {
                Ok(cp) => run.checkpoints.push(cp),
                Err(e) => return Err(run.fail(Stage::Staging, e)),
            }
        }

        // Dimensions
        if let Err(e) = self
            .check_cancelled()
            .and_then(|_| run.advance(RunPhase::DimensionsInProgress))
        {
            return Err(run.fail(Stage::Staging, e));
        }
        if let Err(e) = self.load_dimensions(plan, &mut run.checkpoints).await {
            return Err(run.fail(Stage::Dimensions, e));
        }

        // Facts
        if let Err(e) = self
            .check_cancelled()
            .and_then(|_| run.advance(RunPhase::FactsInProgress))
        {
            return Err(run.fail(Stage::Dimensions, e));
        }
        for entry in plan.fact_entries() {
            if let Err(e) = self.check_cancelled() {
                return Err(run.fail(Stage::Facts, e));
            }
            match self.load_table_entry(entry).await {
                Ok(cp) => run.checkpoints.push(cp),
                Err(e) => return Err(run.fail(Stage::Facts, e)),
            }
        }

        // Verification
        if let Err(e) = verify(plan, &run.checkpoints) {
            return Err(run.fail(Stage::Verification, e));
        }
        if let Err(e) = run.advance(RunPhase::Verified) {
            return Err(run.fail(Stage::Verification, e));
        }

        if !self.options.keep_staging {
            self.drop_staging(plan).await;
        }
        if let Err(e) = run.advance(RunPhase::Done) {
            return Err(run.fail(Stage::Verification, e));
        }

        log::info!(
            "Load run {} done: {} tables in {:.1}s",
            run.run_id,
            run.checkpoints.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(LoadReport {
            run_id: run.run_id,
            started_at,
            finished_at: Utc::now(),
            checkpoints: run.checkpoints,
        })
    }

    fn check_cancelled(&self) -> LoadResult<()> {
        if self.cancel.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn connection(&self, table: &str) -> LoadResult<Box<dyn BulkLoader>> {
        self.pool
            .connection()
            .await
            .map_err(|e| LoadError::TargetUnavailable {
                table: table.to_string(),
                message: e.to_string(),
            })
    }

    async fn load_staging_entry(&self, entry: &LoadEntry) -> LoadResult<Checkpoint> {
        let LoadEntry::Staging { target, source } = entry else {
            return Err(unexpected_entry(entry, "staging"));
        };
        let spec = self.catalog.get_table_spec(target)?;
        let table = spec.name.as_str();
        let conn = self.connection(table).await?;
        let conn = conn.as_ref();

        // Staging relations are run-scoped and may have been dropped by a
        // previous run.
        conn.execute_batch(&ddl::create_table_sql(spec))
            .await
            .map_err(|e| LoadError::staging(table, e))?;

        let timeout = self.options.timeout;
        let row_count = self
            .options
            .retry
            .run(table, &self.cancel, |attempt| async move {
                if attempt > 1 {
                    log::info!("{table}: attempt {attempt}");
                }
                conn.begin_transaction()
                    .await
                    .map_err(|e| LoadError::staging(table, e))?;
                let result = async {
                    truncate(conn, spec).await?;
                    load_staging(source, spec, conn, timeout).await
                }
                .await;
                finish(conn, table, result, LoadError::staging).await
            })
            .await?;

        Ok(Checkpoint {
            table: spec.name.clone(),
            stage: Stage::Staging,
            rows_before: 0,
            row_count,
            source_rows: row_count,
            unmatched: 0,
            captured_at: Utc::now(),
        })
    }

    async fn load_dimensions(
        &self,
        plan: &LoadPlan,
        checkpoints: &mut Vec<Checkpoint>,
    ) -> LoadResult<()> {
        let entries = plan.dimension_entries();
        if self.options.parallel_dimensions {
            log::debug!("Loading {} dimensions concurrently", entries.len());
            let results = join_all(entries.iter().map(|e| self.load_table_entry(e))).await;
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(cp) => checkpoints.push(cp),
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        for entry in entries {
            self.check_cancelled()?;
            checkpoints.push(self.load_table_entry(entry).await?);
        }
        Ok(())
    }

    /// Dedupe, upsert, and count one dimension or fact table in a single transaction
    async fn load_table_entry(&self, entry: &LoadEntry) -> LoadResult<Checkpoint> {
        let LoadEntry::Table {
            source,
            target,
            transform,
        } = entry
        else {
            return Err(unexpected_entry(entry, "table"));
        };
        let spec = self.catalog.get_table_spec(target)?;
        let staging = self.catalog.get_table_spec(source)?;
        let table = spec.name.as_str();
        let stage = match spec.kind {
            TableKind::Fact => Stage::Facts,
            _ => Stage::Dimensions,
        };

        let start = Instant::now();
        let rows = dedupe(staging, &spec.name, transform)?;
        let conn = self.connection(table).await?;
        let conn = conn.as_ref();

        conn.begin_transaction()
            .await
            .map_err(|e| LoadError::upsert(table, e))?;
        let result = async {
            let rows_before = count_rows(conn, spec)
                .await
                .map_err(|e| LoadError::upsert(table, e))?;
            let outcome =
                upsert(&rows, spec, &transform.policy, &transform.natural_key, conn).await?;
            let row_count = count_rows(conn, spec)
                .await
                .map_err(|e| LoadError::upsert(table, e))?;
            Ok(Checkpoint {
                table: spec.name.clone(),
                stage,
                rows_before,
                row_count,
                source_rows: outcome.matched,
                unmatched: outcome.unmatched,
                captured_at: Utc::now(),
            })
        }
        .await;
        let checkpoint = finish(conn, table, result, LoadError::upsert).await?;

        log::info!(
            "{table}: {} -> {} rows ({} unmatched) in {}ms",
            checkpoint.rows_before,
            checkpoint.row_count,
            checkpoint.unmatched,
            start.elapsed().as_millis()
        );
        Ok(checkpoint)
    }

    async fn drop_staging(&self, plan: &LoadPlan) {
        for entry in plan.staging_entries() {
            let Ok(spec) = self.catalog.get_table_spec(entry.target()) else {
                continue;
            };
            let result = match self.pool.connection().await {
                Ok(conn) => conn.execute_batch(&ddl::drop_table_sql(spec)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => log::debug!("Dropped staging table {}", spec.name),
                Err(e) => log::warn!("Failed to drop staging table {}: {e}", spec.name),
            }
        }
    }
}

/// Commit on success, roll back on failure
async fn finish<T>(
    conn: &dyn BulkLoader,
    table: &str,
    result: LoadResult<T>,
    classify: fn(&str, sl_db::DbError) -> LoadError,
) -> LoadResult<T> {
    match result {
        Ok(value) => {
            conn.commit().await.map_err(|e| classify(table, e))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = conn.rollback().await {
                log::warn!("{table}: rollback failed: {rb}");
            }
            Err(e)
        }
    }
}

/// Bound every dimension and fact checkpoint by the rows offered to it and
/// by the rows of the staging relation it was derived from.
fn verify(plan: &LoadPlan, checkpoints: &[Checkpoint]) -> LoadResult<()> {
    let staged = |table: &TableName| {
        checkpoints
            .iter()
            .find(|c| c.stage == Stage::Staging && c.table == *table)
            .map(|c| c.row_count)
    };

    for entry in plan.dimension_entries().iter().chain(plan.fact_entries()) {
        let LoadEntry::Table { source, target, .. } = entry else {
            continue;
        };
        let Some(cp) = checkpoints.iter().find(|c| c.table == *target) else {
            continue;
        };
        if cp.rows_added() > cp.source_rows {
            return Err(LoadError::VerificationFailed {
                table: cp.table.to_string(),
                rows_added: cp.rows_added(),
                source_rows: cp.source_rows,
            });
        }
        if let Some(staged_rows) = staged(source) {
            let rows = cp.rows_added().max(cp.source_rows);
            if rows > staged_rows {
                return Err(LoadError::ExceedsStaging {
                    table: cp.table.to_string(),
                    staging: source.to_string(),
                    rows,
                    staged_rows,
                });
            }
        }
    }
    Ok(())
}

fn unexpected_entry(entry: &LoadEntry, expected: &str) -> LoadError {
    LoadError::Catalog(sl_core::CoreError::InvalidPlan {
        entry: entry.target().to_string(),
        reason: format!("expected a {expected} entry"),
    })
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
