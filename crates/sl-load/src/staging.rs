//! Staging Loader: bulk copy from an external location into a staging relation

use crate::error::{LoadError, LoadResult};
use sl_core::{ddl, StagingSource, TableSpec};
use sl_db::BulkLoader;
use std::time::{Duration, Instant};

/// Copy every record at `source` into the staging relation `target` and
/// return the number of rows the relation holds afterwards.
///
/// The copy is bounded by `timeout`. The caller owns the transaction and
/// truncates the relation before each attempt, so a retried copy never
/// duplicates rows.
pub async fn load_staging<W>(
    source: &StagingSource,
    target: &TableSpec,
    conn: &W,
    timeout: Duration,
) -> LoadResult<u64>
where
    W: BulkLoader + ?Sized,
{
    let table = target.name.as_str();
    let columns: Vec<String> = target
        .loadable_columns()
        .into_iter()
        .map(|c| c.to_string())
        .collect();

    log::debug!(
        "Copying {} ({}) into {table}",
        source.uri,
        source.format
    );
    let start = Instant::now();
    let copy = conn.bulk_copy(
        &source.uri,
        table,
        &columns,
        source.format,
        source.credential_ref.as_deref(),
    );
    let copied = match tokio::time::timeout(timeout, copy).await {
        Ok(result) => result.map_err(|e| LoadError::staging(table, e))?,
        Err(_) => {
            return Err(LoadError::LoadTimeout {
                table: table.to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }
    };

    let row_count = count_rows(conn, target)
        .await
        .map_err(|e| LoadError::staging(table, e))?;
    if row_count == 0 {
        log::warn!("{table}: source {} produced no rows", source.uri);
    }
    log::info!(
        "{table}: copied {copied} rows in {}ms",
        start.elapsed().as_millis()
    );
    Ok(row_count)
}

/// Remove every row from a staging relation
pub async fn truncate<W>(conn: &W, target: &TableSpec) -> LoadResult<()>
where
    W: BulkLoader + ?Sized,
{
    conn.execute(&ddl::truncate_sql(target))
        .await
        .map_err(|e| LoadError::staging(target.name.as_str(), e))?;
    Ok(())
}

pub(crate) async fn count_rows<W>(conn: &W, spec: &TableSpec) -> sl_db::DbResult<u64>
where
    W: sl_db::Warehouse + ?Sized,
{
    conn.query_count(&format!("SELECT * FROM {}", spec.name.quoted()))
        .await
}

#[cfg(test)]
#[path = "staging_test.rs"]
mod tests;
