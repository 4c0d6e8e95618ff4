use super::*;
use async_trait::async_trait;
use sl_core::{SourceFormat, StagingSource};
use sl_db::{DbError, DbResult, DuckDbPool, Row, Warehouse};
use std::sync::atomic::{AtomicU32, AtomicUsize};

const EVENTS: &str = r#"{"artist": "Muse", "firstName": "Ada", "lastName": "L", "gender": "F", "itemInSession": 0, "length": 200.0, "level": "free", "page": "NextSong", "sessionId": 1, "song": "Uprising", "ts": 1541105830796, "userId": "42"}
{"artist": "Muse", "firstName": "Ada", "lastName": "L", "gender": "F", "itemInSession": 1, "length": 200.0, "level": "paid", "page": "NextSong", "sessionId": 1, "song": "Uprising", "ts": 1541105830796, "userId": "42"}
"#;

const SONGS: &str = r#"{"num_songs": 1, "artist_id": "AR1", "artist_latitude": null, "artist_longitude": null, "artist_location": "Teignmouth", "artist_name": "Muse", "song_id": "S1", "title": "Uprising", "duration": 200.0, "year": 2009}
"#;

struct Fixture {
    pool: DuckDbPool,
    catalog: SchemaCatalog,
    dir: tempfile::TempDir,
}

impl Fixture {
    async fn new() -> Self {
        let pool = DuckDbPool::in_memory().unwrap();
        let catalog = SchemaCatalog::sparkify().unwrap();
        for spec in catalog.dependency_order() {
            pool.root()
                .execute_batch(&ddl::create_table_sql(spec))
                .await
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("events.json"), EVENTS).unwrap();
        std::fs::write(dir.path().join("songs.json"), SONGS).unwrap();
        Self { pool, catalog, dir }
    }

    fn plan(&self) -> LoadPlan {
        let path = |name: &str| self.dir.path().join(name).display().to_string();
        LoadPlan::sparkify(
            &self.catalog,
            StagingSource::json(path("events.json")),
            StagingSource::json(path("songs.json")),
        )
        .unwrap()
    }

    fn orchestrator(&self, options: LoadOptions) -> Orchestrator<'_> {
        Orchestrator::new(&self.pool, &self.catalog, options)
    }

    async fn count(&self, table: &str) -> u64 {
        self.pool
            .root()
            .query_count(&format!("SELECT * FROM \"{table}\""))
            .await
            .unwrap()
    }
}

fn checkpoint(table: &str, stage: Stage, before: u64, after: u64, source: u64) -> Checkpoint {
    Checkpoint {
        table: TableName::new(table),
        stage,
        rows_before: before,
        row_count: after,
        source_rows: source,
        unmatched: 0,
        captured_at: Utc::now(),
    }
}

#[test]
fn test_phase_happy_path() {
    use RunPhase::*;
    let path = [
        Idle,
        StagingInProgress,
        DimensionsInProgress,
        FactsInProgress,
        Verified,
        Done,
    ];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
    }
    assert!(Done.is_terminal());
}

#[test]
fn test_phase_rejects_skips_and_restarts() {
    use RunPhase::*;
    assert!(!Idle.can_transition_to(&DimensionsInProgress));
    assert!(!StagingInProgress.can_transition_to(&FactsInProgress));
    assert!(!Done.can_transition_to(&Idle));
    assert!(!Idle.can_transition_to(&Failed(Stage::Staging)));
    assert!(!StagingInProgress.can_transition_to(&Failed(Stage::Facts)));
    assert!(DimensionsInProgress.can_transition_to(&Failed(Stage::Dimensions)));
    assert!(FactsInProgress.can_transition_to(&Failed(Stage::Verification)));
    assert!(Verified.can_transition_to(&Failed(Stage::Verification)));
    assert!(!Verified.can_transition_to(&Failed(Stage::Facts)));
    assert!(!Failed(Stage::Facts).can_transition_to(&Done));
}

#[test]
fn test_phase_stage() {
    assert_eq!(RunPhase::FactsInProgress.stage(), Some(Stage::Facts));
    assert_eq!(RunPhase::Failed(Stage::Staging).stage(), Some(Stage::Staging));
    assert_eq!(RunPhase::Idle.stage(), None);
    assert_eq!(RunPhase::Failed(Stage::Facts).to_string(), "failed(facts)");
}

#[test]
fn test_cancel_token_is_shared() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}

fn sparkify_plan() -> LoadPlan {
    let catalog = SchemaCatalog::sparkify().unwrap();
    LoadPlan::sparkify(
        &catalog,
        StagingSource::json("events.json"),
        StagingSource::json("songs.json"),
    )
    .unwrap()
}

#[test]
fn test_verify_bounds_growth_by_source_rows() {
    let plan = sparkify_plan();
    let ok = vec![
        checkpoint("staging_events", Stage::Staging, 0, 1000, 1000),
        checkpoint("users", Stage::Dimensions, 5, 8, 3),
        checkpoint("songplays", Stage::Facts, 0, 950, 950),
    ];
    assert!(verify(&plan, &ok).is_ok());

    let bad = vec![checkpoint("songplays", Stage::Facts, 0, 951, 950)];
    let err = verify(&plan, &bad).unwrap_err();
    assert!(matches!(
        err,
        LoadError::VerificationFailed { rows_added: 951, source_rows: 950, .. }
    ));
}

#[test]
fn test_verify_bounds_facts_by_staged_rows() {
    let plan = sparkify_plan();
    let checkpoints = vec![
        checkpoint("staging_events", Stage::Staging, 0, 10, 10),
        checkpoint("staging_songs", Stage::Staging, 0, 500, 500),
        checkpoint("songplays", Stage::Facts, 0, 1000, 1000),
    ];
    let err = verify(&plan, &checkpoints).unwrap_err();
    match err {
        LoadError::ExceedsStaging {
            table,
            staging,
            rows,
            staged_rows,
        } => {
            assert_eq!(table, "songplays");
            assert_eq!(staging, "staging_events");
            assert_eq!(rows, 1000);
            assert_eq!(staged_rows, 10);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_verify_bounds_dimensions_by_their_own_staging() {
    let plan = sparkify_plan();
    // songs derive from staging_songs, so the small event batch does not bound them
    let checkpoints = vec![
        checkpoint("staging_events", Stage::Staging, 0, 2, 2),
        checkpoint("staging_songs", Stage::Staging, 0, 40, 40),
        checkpoint("songs", Stage::Dimensions, 0, 40, 40),
    ];
    assert!(verify(&plan, &checkpoints).is_ok());

    let too_many = vec![
        checkpoint("staging_songs", Stage::Staging, 0, 40, 40),
        checkpoint("artists", Stage::Dimensions, 100, 100, 41),
    ];
    assert!(matches!(
        verify(&plan, &too_many),
        Err(LoadError::ExceedsStaging { rows: 41, .. })
    ));
}

#[test]
fn test_options_from_config() {
    let config = Config::from_yaml(
        "name: t\nsources:\n  log_data: {uri: a}\n  song_data: {uri: b}\n\
         load: {timeout_secs: 5, parallel_dimensions: true, keep_staging: false}\n\
         retry: {max_attempts: 4, base_delay_ms: 10, max_delay_ms: 20}\n",
    )
    .unwrap();
    let options = LoadOptions::from_config(&config);
    assert_eq!(options.timeout, Duration::from_secs(5));
    assert!(options.parallel_dimensions);
    assert!(!options.keep_staging);
    assert_eq!(options.retry.max_attempts, 4);
}

#[tokio::test]
async fn test_run_load_fills_every_table() {
    let fx = Fixture::new().await;
    let report = fx
        .orchestrator(LoadOptions::default())
        .run_load(&fx.plan())
        .await
        .unwrap();

    let tables: Vec<&str> = report.checkpoints.iter().map(|c| c.table.as_str()).collect();
    assert_eq!(
        tables,
        vec!["staging_events", "staging_songs", "users", "songs", "artists", "time", "songplays"]
    );
    assert_eq!(fx.count("users").await, 1);
    assert_eq!(fx.count("songs").await, 1);
    assert_eq!(fx.count("artists").await, 1);
    assert_eq!(fx.count("time").await, 1);
    assert_eq!(fx.count("songplays").await, 2);
    assert_eq!(report.checkpoint("songplays").unwrap().unmatched, 0);
    assert!(!report.run_id.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator(LoadOptions::default());
    orchestrator.cancel_token().cancel();

    let failure = orchestrator.run_load(&fx.plan()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Staging);
    assert!(matches!(failure.reason, LoadError::Cancelled));
    assert!(failure.checkpoints.is_empty());
    assert_eq!(fx.count("users").await, 0);
}

#[tokio::test]
async fn test_unreachable_source_fails_staging_after_retries() {
    let fx = Fixture::new().await;
    let plan = LoadPlan::sparkify(
        &fx.catalog,
        StagingSource::json("/nonexistent/log_data/*.json"),
        StagingSource::json("/nonexistent/song_data/*.json"),
    )
    .unwrap();
    let options = LoadOptions {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..LoadOptions::default()
    };

    let failure = fx.orchestrator(options).run_load(&plan).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Staging);
    assert!(matches!(failure.reason, LoadError::SourceUnreachable { .. }));
    assert_eq!(fx.count("users").await, 0);
}

#[tokio::test]
async fn test_drop_staging_when_not_kept() {
    let fx = Fixture::new().await;
    let options = LoadOptions {
        keep_staging: false,
        ..LoadOptions::default()
    };
    fx.orchestrator(options.clone())
        .run_load(&fx.plan())
        .await
        .unwrap();
    assert!(!fx.pool.root().relation_exists("staging_events").await.unwrap());

    // The next run recreates the staging relations.
    fx.orchestrator(options).run_load(&fx.plan()).await.unwrap();
    assert_eq!(fx.count("songplays").await, 2);
}

#[tokio::test]
async fn test_parallel_dimensions_match_sequential() {
    let fx = Fixture::new().await;
    let options = LoadOptions {
        parallel_dimensions: true,
        ..LoadOptions::default()
    };
    let report = fx.orchestrator(options).run_load(&fx.plan()).await.unwrap();
    assert_eq!(report.stage_checkpoints(Stage::Dimensions).count(), 4);
    assert_eq!(fx.count("songplays").await, 2);
}

#[tokio::test]
async fn test_cancel_during_staging_backoff() {
    let fx = Fixture::new().await;
    let plan = LoadPlan::sparkify(
        &fx.catalog,
        StagingSource::json("/nonexistent/log_data/*.json"),
        StagingSource::json("/nonexistent/song_data/*.json"),
    )
    .unwrap();
    let options = LoadOptions {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(2),
        },
        ..LoadOptions::default()
    };
    let orchestrator = fx.orchestrator(options);
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let failure = orchestrator.run_load(&plan).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Staging);
    assert!(matches!(failure.reason, LoadError::Cancelled), "got {:?}", failure.reason);
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_dimension_failure_reports_staging_checkpoints() {
    let fx = Fixture::new().await;
    fx.pool.root().execute_batch("DROP TABLE users").await.unwrap();

    let failure = fx
        .orchestrator(LoadOptions::default())
        .run_load(&fx.plan())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Dimensions);
    assert!(matches!(failure.reason, LoadError::TargetUnavailable { .. }), "got {:?}", failure.reason);
    let tables: Vec<&str> = failure.checkpoints.iter().map(|c| c.table.as_str()).collect();
    assert_eq!(tables, vec!["staging_events", "staging_songs"]);
    assert_eq!(failure.checkpoints[0].row_count, 2);
    // Staging committed before the failure and stays committed.
    assert_eq!(fx.count("staging_events").await, 2);
    assert_eq!(fx.count("songplays").await, 0);
}

#[tokio::test]
async fn test_fact_failure_keeps_dimension_commits() {
    let fx = Fixture::new().await;
    fx.pool.root().execute_batch("DROP TABLE songplays").await.unwrap();

    let failure = fx
        .orchestrator(LoadOptions::default())
        .run_load(&fx.plan())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Facts);
    assert_eq!(failure.checkpoints.len(), 6);
    assert_eq!(failure.checkpoints.last().unwrap().table, "time");
    assert_eq!(fx.count("users").await, 1);
}

/// Pool that cancels the run when session number `cancel_at` is handed out
struct CancellingPool {
    inner: DuckDbPool,
    cancel: CancelToken,
    cancel_at: usize,
    sessions: AtomicUsize,
}

#[async_trait]
impl WarehousePool for CancellingPool {
    async fn connection(&self) -> DbResult<Box<dyn BulkLoader>> {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if session == self.cancel_at {
            self.cancel.cancel();
        }
        self.inner.connection().await
    }
}

#[tokio::test]
async fn test_cancel_between_dimensions_keeps_finished_work() {
    let fx = Fixture::new().await;
    let cancel = CancelToken::new();
    // Sessions 1 and 2 load staging; session 3 loads users.
    let pool = CancellingPool {
        inner: DuckDbPool::in_memory().unwrap(),
        cancel: cancel.clone(),
        cancel_at: 3,
        sessions: AtomicUsize::new(0),
    };
    for spec in fx.catalog.dependency_order() {
        pool.inner
            .root()
            .execute_batch(&ddl::create_table_sql(spec))
            .await
            .unwrap();
    }

    let failure = Orchestrator::new(&pool, &fx.catalog, LoadOptions::default())
        .with_cancel_token(cancel)
        .run_load(&fx.plan())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Dimensions);
    assert!(matches!(failure.reason, LoadError::Cancelled));
    let tables: Vec<&str> = failure.checkpoints.iter().map(|c| c.table.as_str()).collect();
    // The in-flight users load ran to completion before the cancel was honored.
    assert_eq!(tables, vec!["staging_events", "staging_songs", "users"]);

    let root = pool.inner.root();
    assert_eq!(root.query_count("SELECT * FROM staging_events").await.unwrap(), 2);
    assert_eq!(root.query_count("SELECT * FROM users").await.unwrap(), 1);
    assert_eq!(root.query_count("SELECT * FROM songs").await.unwrap(), 0);
}

/// Session whose bulk copies write their rows and then fail while
/// `failures` is non-zero. Its rollback keeps what was written, like a
/// loader that cannot undo a partial copy.
struct FlakySession {
    inner: Box<dyn BulkLoader>,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl Warehouse for FlakySession {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        self.inner.execute(sql).await
    }
    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.inner.execute_batch(sql).await
    }
    async fn query(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.inner.query(sql).await
    }
    async fn query_count(&self, sql: &str) -> DbResult<u64> {
        self.inner.query_count(sql).await
    }
    async fn begin_transaction(&self) -> DbResult<()> {
        self.inner.begin_transaction().await
    }
    async fn commit(&self) -> DbResult<()> {
        self.inner.commit().await
    }
    async fn rollback(&self) -> DbResult<()> {
        self.inner.commit().await
    }
    async fn relation_exists(&self, name: &str) -> DbResult<bool> {
        self.inner.relation_exists(name).await
    }
    async fn table_columns(&self, name: &str) -> DbResult<Vec<String>> {
        self.inner.table_columns(name).await
    }
    fn db_type(&self) -> &'static str {
        self.inner.db_type()
    }
}

#[async_trait]
impl BulkLoader for FlakySession {
    async fn bulk_copy(
        &self,
        source_uri: &str,
        target: &str,
        columns: &[String],
        format: SourceFormat,
        credential_ref: Option<&str>,
    ) -> DbResult<u64> {
        let copied = self
            .inner
            .bulk_copy(source_uri, target, columns, format, credential_ref)
            .await?;
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DbError::SourceUnreachable(format!(
                "connection reset after {copied} rows"
            )));
        }
        Ok(copied)
    }
}

struct FlakyPool {
    inner: DuckDbPool,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl WarehousePool for FlakyPool {
    async fn connection(&self) -> DbResult<Box<dyn BulkLoader>> {
        Ok(Box::new(FlakySession {
            inner: self.inner.connection().await?,
            failures: Arc::clone(&self.failures),
        }))
    }
}

#[tokio::test]
async fn test_retry_truncates_partial_staging_copy() {
    let fx = Fixture::new().await;
    let pool = FlakyPool {
        inner: DuckDbPool::in_memory().unwrap(),
        failures: Arc::new(AtomicU32::new(2)),
    };
    for spec in fx.catalog.dependency_order() {
        pool.inner
            .root()
            .execute_batch(&ddl::create_table_sql(spec))
            .await
            .unwrap();
    }
    let options = LoadOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..LoadOptions::default()
    };

    let report = Orchestrator::new(&pool, &fx.catalog, options)
        .run_load(&fx.plan())
        .await
        .unwrap();

    assert_eq!(pool.failures.load(Ordering::SeqCst), 0);
    let root = pool.inner.root();
    // Two failed attempts each left a partial copy behind; only the last survives.
    assert_eq!(root.query_count("SELECT * FROM staging_events").await.unwrap(), 2);
    assert_eq!(report.checkpoint("staging_events").unwrap().row_count, 2);
    assert_eq!(root.query_count("SELECT * FROM songplays").await.unwrap(), 2);
}
