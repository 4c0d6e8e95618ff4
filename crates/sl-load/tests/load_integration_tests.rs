//! End-to-end load runs against an in-memory DuckDB warehouse

use async_trait::async_trait;
use sl_core::{ddl, LoadPlan, SchemaCatalog, SourceFormat, Stage, StagingSource};
use sl_db::{BulkLoader, DbResult, DuckDbPool, Row, Value, Warehouse, WarehousePool};
use sl_load::{LoadOptions, Orchestrator};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

struct TestWarehouse {
    pool: DuckDbPool,
    catalog: SchemaCatalog,
}

impl TestWarehouse {
    async fn new() -> Self {
        let pool = DuckDbPool::in_memory().unwrap();
        let catalog = SchemaCatalog::sparkify().unwrap();
        for spec in catalog.dependency_order() {
            pool.root()
                .execute_batch(&ddl::create_table_sql(spec))
                .await
                .unwrap();
        }
        Self { pool, catalog }
    }

    async fn load(&self, data: &DataDir) -> sl_core::LoadReport {
        Orchestrator::new(&self.pool, &self.catalog, LoadOptions::default())
            .run_load(&data.plan(&self.catalog))
            .await
            .unwrap()
    }

    async fn count(&self, sql: &str) -> u64 {
        self.pool.root().query_count(sql).await.unwrap()
    }

    async fn rows(&self, sql: &str) -> Vec<Row> {
        self.pool.root().query(sql).await.unwrap()
    }

    /// Every warehouse table rendered as ordered text
    async fn dump(&self) -> Vec<String> {
        let mut out = Vec::new();
        for table in ["users", "songs", "artists", "time", "songplays"] {
            for row in self
                .rows(&format!("SELECT * FROM \"{table}\" ORDER BY ALL"))
                .await
            {
                let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                out.push(format!("{table}|{}", cells.join("|")));
            }
        }
        out
    }
}

/// Event and song files written to a temporary directory
struct DataDir {
    dir: tempfile::TempDir,
}

impl DataDir {
    fn new(events: &[String], songs: &[String]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("events.json"), events.join("\n")).unwrap();
        std::fs::write(dir.path().join("songs.json"), songs.join("\n")).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn plan(&self, catalog: &SchemaCatalog) -> LoadPlan {
        LoadPlan::sparkify(
            catalog,
            StagingSource::json(self.path("events.json").display().to_string()),
            StagingSource::json(self.path("songs.json").display().to_string()),
        )
        .unwrap()
    }
}

fn event(user: &str, level: &str, session: i64, item: i64, ts: i64, song: &str) -> String {
    format!(
        r#"{{"artist": "Muse", "auth": "Logged In", "firstName": "Ada", "gender": "F", "itemInSession": {item}, "lastName": "Lovelace", "length": 200.0, "level": "{level}", "location": "London", "method": "PUT", "page": "NextSong", "registration": 1540919166796.0, "sessionId": {session}, "song": "{song}", "status": 200, "ts": {ts}, "userAgent": "Mozilla/5.0", "userId": "{user}"}}"#
    )
}

fn page_view(user: &str, ts: i64) -> String {
    format!(
        r#"{{"artist": null, "auth": "Logged In", "itemInSession": 0, "length": null, "level": "free", "page": "Home", "sessionId": 99, "song": null, "ts": {ts}, "userId": "{user}"}}"#
    )
}

fn song(song_id: &str, title: &str) -> String {
    format!(
        r#"{{"num_songs": 1, "artist_id": "AR1", "artist_latitude": 50.5, "artist_longitude": -3.5, "artist_location": "Teignmouth", "artist_name": "Muse", "song_id": "{song_id}", "title": "{title}", "duration": 200.0, "year": 2009}}"#
    )
}

fn sample() -> DataDir {
    DataDir::new(
        &[
            event("42", "free", 1, 0, 1541105830796, "Uprising"),
            event("42", "free", 1, 1, 1541105831796, "Resistance"),
            event("7", "paid", 2, 0, 1541105832796, "Uprising"),
            event("7", "paid", 2, 1, 1541105833796, "Unknown Song"),
            page_view("", 1541105834796),
        ],
        &[song("S1", "Uprising"), song("S2", "Resistance")],
    )
}

#[tokio::test]
async fn test_identical_staging_yields_identical_warehouse() {
    let data = sample();
    let first = TestWarehouse::new().await;
    let second = TestWarehouse::new().await;
    first.load(&data).await;
    second.load(&data).await;

    let dump = first.dump().await;
    assert!(!dump.is_empty());
    assert_eq!(dump, second.dump().await);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let data = sample();
    let wh = TestWarehouse::new().await;
    wh.load(&data).await;
    let before = wh.dump().await;

    let report = wh.load(&data).await;
    assert_eq!(wh.dump().await, before);
    for cp in report.checkpoints.iter().filter(|c| c.stage != Stage::Staging) {
        assert_eq!(cp.rows_added(), 0, "{} grew on re-run", cp.table);
    }
}

#[tokio::test]
async fn test_user_level_is_updated_across_runs() {
    let wh = TestWarehouse::new().await;
    wh.load(&DataDir::new(
        &[event("42", "free", 1, 0, 1000, "Uprising")],
        &[song("S1", "Uprising")],
    ))
    .await;
    wh.load(&DataDir::new(
        &[event("42", "paid", 5, 0, 9000, "Uprising")],
        &[song("S1", "Uprising")],
    ))
    .await;

    let rows = wh
        .rows("SELECT level, first_name FROM users WHERE user_id = 42")
        .await;
    assert_eq!(rows, vec![vec![Value::from("paid"), Value::from("Ada")]]);
    assert_eq!(wh.count("SELECT * FROM users").await, 1);
}

#[tokio::test]
async fn test_same_timestamp_duplicate_resolves_to_latest_loaded() {
    let wh = TestWarehouse::new().await;
    wh.load(&DataDir::new(
        &[
            event("42", "free", 1, 0, 1000, "Uprising"),
            event("42", "paid", 1, 1, 1000, "Uprising"),
        ],
        &[song("S1", "Uprising")],
    ))
    .await;

    let rows = wh.rows("SELECT level FROM users WHERE user_id = 42").await;
    assert_eq!(rows, vec![vec![Value::from("paid")]]);
}

#[tokio::test]
async fn test_every_songplay_references_existing_dimensions() {
    let data = sample();
    let wh = TestWarehouse::new().await;
    wh.load(&data).await;

    assert_eq!(wh.count("SELECT * FROM songplays").await, 3);
    let orphans = wh
        .count(
            "SELECT * FROM songplays p WHERE \
               NOT EXISTS (SELECT 1 FROM users u WHERE u.user_id = p.user_id) \
            OR NOT EXISTS (SELECT 1 FROM songs s WHERE s.song_id = p.song_id) \
            OR NOT EXISTS (SELECT 1 FROM artists a WHERE a.artist_id = p.artist_id) \
            OR NOT EXISTS (SELECT 1 FROM \"time\" t WHERE t.start_time = p.start_time)",
        )
        .await;
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn test_matched_and_unmatched_songplays() {
    let songs: Vec<String> = (0..50)
        .map(|i| song(&format!("S{i:02}"), &format!("Song {i}")))
        .collect();
    let events: Vec<String> = (0..1000)
        .map(|i| {
            let title = if i < 950 {
                format!("Song {}", i % 50)
            } else {
                format!("Missing {i}")
            };
            let user = (i % 10 + 1).to_string();
            event(&user, "free", i / 10, i % 10, 1_541_105_830_000 + i * 1000, &title)
        })
        .collect();

    let wh = TestWarehouse::new().await;
    let report = wh.load(&DataDir::new(&events, &songs)).await;

    let plays = report.checkpoint("songplays").unwrap();
    assert_eq!(plays.row_count, 950);
    assert_eq!(plays.unmatched, 50);
    assert_eq!(plays.source_rows, 950);
    assert_eq!(report.total_unmatched(), 50);
    assert_eq!(report.checkpoint("staging_events").unwrap().row_count, 1000);
    assert_eq!(wh.count("SELECT * FROM users").await, 10);
    assert_eq!(wh.count("SELECT * FROM \"time\"").await, 1000);
}

#[tokio::test]
async fn test_anonymous_page_views_do_not_create_users() {
    let wh = TestWarehouse::new().await;
    wh.load(&sample()).await;
    assert_eq!(wh.count("SELECT * FROM users").await, 2);
    assert_eq!(
        wh.count("SELECT * FROM staging_events WHERE \"userId\" = ''").await,
        1
    );
}

/// Session that records every statement it runs
struct Recording {
    inner: Box<dyn BulkLoader>,
    id: usize,
    log: Arc<Mutex<Vec<(usize, String)>>>,
}

impl Recording {
    fn record(&self, event: &str) {
        self.log.lock().unwrap().push((self.id, event.to_string()));
    }
}

#[async_trait]
impl Warehouse for Recording {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        self.record(sql);
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
        self.record("BEGIN");
        self.inner.begin_transaction().await
    }
    async fn commit(&self) -> DbResult<()> {
        let result = self.inner.commit().await;
        self.record("COMMIT");
        result
    }
    async fn rollback(&self) -> DbResult<()> {
        self.record("ROLLBACK");
        self.inner.rollback().await
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
impl BulkLoader for Recording {
    async fn bulk_copy(
        &self,
        source_uri: &str,
        target: &str,
        columns: &[String],
        format: SourceFormat,
        credential_ref: Option<&str>,
    ) -> DbResult<u64> {
        self.record(&format!("COPY {target}"));
        self.inner
            .bulk_copy(source_uri, target, columns, format, credential_ref)
            .await
    }
}

struct RecordingPool {
    inner: DuckDbPool,
    log: Arc<Mutex<Vec<(usize, String)>>>,
    sessions: Mutex<usize>,
}

#[async_trait]
impl WarehousePool for RecordingPool {
    async fn connection(&self) -> DbResult<Box<dyn BulkLoader>> {
        let id = {
            let mut sessions = self.sessions.lock().unwrap();
            *sessions += 1;
            *sessions
        };
        Ok(Box::new(Recording {
            inner: self.inner.connection().await?,
            id,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Index of the COMMIT closing the transaction that wrote `table`
fn commit_of(log: &[(usize, String)], table: &str) -> usize {
    let insert = format!("INSERT INTO \"{table}\"");
    let (write_at, session) = log
        .iter()
        .enumerate()
        .find(|(_, (_, sql))| sql.starts_with(&insert) || *sql == format!("COPY {table}"))
        .map(|(i, (id, _))| (i, *id))
        .unwrap_or_else(|| panic!("no write to {table}"));
    log.iter()
        .enumerate()
        .skip(write_at)
        .find(|(_, (id, sql))| *id == session && sql == "COMMIT")
        .map(|(i, _)| i)
        .unwrap_or_else(|| panic!("no commit for {table}"))
}

fn begin_of(log: &[(usize, String)], table: &str) -> usize {
    let insert = format!("INSERT INTO \"{table}\"");
    let (write_at, session) = log
        .iter()
        .enumerate()
        .find(|(_, (_, sql))| sql.starts_with(&insert))
        .map(|(i, (id, _))| (i, *id))
        .unwrap_or_else(|| panic!("no write to {table}"));
    log[..write_at]
        .iter()
        .enumerate()
        .rev()
        .find(|(_, (id, sql))| *id == session && sql == "BEGIN")
        .map(|(i, _)| i)
        .unwrap_or_else(|| panic!("no begin for {table}"))
}

async fn recorded_run(parallel: bool) -> Vec<(usize, String)> {
    let wh = TestWarehouse::new().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = RecordingPool {
        inner: wh.pool,
        log: Arc::clone(&log),
        sessions: Mutex::new(0),
    };
    let options = LoadOptions {
        parallel_dimensions: parallel,
        ..LoadOptions::default()
    };
    Orchestrator::new(&pool, &wh.catalog, options)
        .run_load(&sample().plan(&wh.catalog))
        .await
        .unwrap();
    let entries = log.lock().unwrap().clone();
    entries
}

#[tokio::test]
async fn test_stages_commit_in_dependency_order() {
    for parallel in [false, true] {
        let log = recorded_run(parallel).await;
        let facts_begin = begin_of(&log, "songplays");
        for staging in ["staging_events", "staging_songs"] {
            let staged = commit_of(&log, staging);
            for dim in ["users", "songs", "artists", "time"] {
                assert!(staged < begin_of(&log, dim), "{staging} before {dim}");
            }
        }
        for dim in ["users", "songs", "artists", "time"] {
            assert!(commit_of(&log, dim) < facts_begin, "{dim} before songplays");
        }
    }
}
