//! Upsert Engine: write canonical rows into a dimension or fact table

use crate::dedup::CanonicalRows;
use crate::error::{LoadError, LoadResult};
use sl_core::sql_utils::quoted_list;
use sl_core::{ColumnName, TableSpec, UpsertPolicy};
use sl_db::Warehouse;

/// Result of one upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    /// Rows inserted or updated
    pub written: u64,
    /// Canonical rows that passed the referential guard
    pub matched: u64,
    /// Candidate rows dropped for lack of a matching source or dimension row
    pub unmatched: u64,
}

/// Insert `rows` into `target`, resolving conflicts on `conflict_columns`
/// according to `policy`.
///
/// Rows whose foreign-key values are missing from the referenced table are
/// skipped and counted as unmatched; they never fail the load.
pub async fn upsert<W>(
    rows: &CanonicalRows,
    target: &TableSpec,
    policy: &UpsertPolicy,
    conflict_columns: &[ColumnName],
    conn: &W,
) -> LoadResult<UpsertOutcome>
where
    W: Warehouse + ?Sized,
{
    let table = target.name.as_str();
    let guarded = guarded_sql(rows, target);

    let candidates = rows.candidate_count(conn).await?;
    let matched = conn
        .query_count(&guarded)
        .await
        .map_err(|e| LoadError::upsert(table, e))?;

    let sql = upsert_sql(&guarded, rows.columns(), target, policy, conflict_columns);
    let written = conn
        .execute(&sql)
        .await
        .map_err(|e| LoadError::upsert(table, e))? as u64;

    let unmatched = candidates.saturating_sub(matched);
    if unmatched > 0 {
        log::warn!("{table}: {unmatched} of {candidates} candidate rows had no match");
    }
    log::debug!("{table}: {matched} canonical rows, {written} written ({policy})");

    Ok(UpsertOutcome {
        written,
        matched,
        unmatched,
    })
}

/// Canonical rows restricted to those whose references resolve
fn guarded_sql(rows: &CanonicalRows, target: &TableSpec) -> String {
    let guards: Vec<String> = target
        .foreign_keys()
        .filter(|(col, _)| rows.columns().contains(&col.name))
        .map(|(col, fk)| {
            format!(
                "(c.{col} IS NULL OR EXISTS (SELECT 1 FROM {table} AS r WHERE r.{ref_col} = c.{col}))",
                col = col.name.quoted(),
                table = fk.table.quoted(),
                ref_col = fk.column.quoted(),
            )
        })
        .collect();

    let cols = rows
        .columns()
        .iter()
        .map(|c| format!("c.{}", c.quoted()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {cols} FROM ({}) AS c", rows.sql());
    if !guards.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&guards.join(" AND "));
    }
    sql
}

fn upsert_sql(
    select: &str,
    columns: &[ColumnName],
    target: &TableSpec,
    policy: &UpsertPolicy,
    conflict_columns: &[ColumnName],
) -> String {
    let action = match policy {
        UpsertPolicy::InsertOnly => "DO NOTHING".to_string(),
        UpsertPolicy::InsertOrUpdate { columns } => format!(
            "DO UPDATE SET {}",
            columns
                .iter()
                .map(|c| format!("{col} = excluded.{col}", col = c.quoted()))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    format!(
        "INSERT INTO {} ({}) {} ON CONFLICT ({}) {}",
        target.name.quoted(),
        quoted_list(columns),
        select,
        quoted_list(conflict_columns),
        action
    )
}

#[cfg(test)]
#[path = "upsert_test.rs"]
mod tests;
