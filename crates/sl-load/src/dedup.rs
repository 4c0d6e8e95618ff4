//! Deduplicator: one canonical row per natural key.
//!
//! Within each natural-key partition the surviving row is the first by the
//! transform's tie-break keys (nulls last), then by the staging row id
//! descending, so the most recently loaded duplicate wins ties. The result
//! is a lazy relation: nothing runs until it is fetched, counted, or
//! consumed by an `INSERT ... SELECT`, and it can be evaluated any number
//! of times with the same result.

use crate::error::{LoadError, LoadResult};
use sl_core::sql_utils::{quote_ident, quoted_list};
use sl_core::{ColumnName, CoreError, SortDirection, TableName, TableSpec, Transform};
use sl_db::{Row, Warehouse};

const ROW_ID: &str = "__row_id";
const RANK: &str = "__rank";

/// Deduplicated rows for one target table, as a restartable SELECT
#[derive(Debug, Clone)]
pub struct CanonicalRows {
    target: TableName,
    columns: Vec<ColumnName>,
    natural_key: Vec<ColumnName>,
    sql: String,
    candidate_sql: String,
}

impl CanonicalRows {
    pub fn target(&self) -> &TableName {
        &self.target
    }

    /// Output columns, in projection order
    pub fn columns(&self) -> &[ColumnName] {
        &self.columns
    }

    pub fn natural_key(&self) -> &[ColumnName] {
        &self.natural_key
    }

    /// The SELECT producing the canonical rows, ordered by natural key
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Materialize every canonical row
    pub async fn fetch<W: Warehouse + ?Sized>(&self, conn: &W) -> LoadResult<Vec<Row>> {
        conn.query(&self.sql)
            .await
            .map_err(|e| LoadError::upsert(self.target.as_str(), e))
    }

    pub async fn count<W: Warehouse + ?Sized>(&self, conn: &W) -> LoadResult<u64> {
        conn.query_count(&self.sql)
            .await
            .map_err(|e| LoadError::upsert(self.target.as_str(), e))
    }

    /// Distinct natural keys in the source before joins are applied
    pub async fn candidate_count<W: Warehouse + ?Sized>(&self, conn: &W) -> LoadResult<u64> {
        conn.query_count(&self.candidate_sql)
            .await
            .map_err(|e| LoadError::upsert(self.target.as_str(), e))
    }
}

/// Build the canonical relation for `target` from `staging` under `transform`.
///
/// The filter and natural-key expressions may only reference the source
/// alias; joined relations contribute to the projection and matching.
pub fn dedupe(
    staging: &TableSpec,
    target: &TableName,
    transform: &Transform,
) -> LoadResult<CanonicalRows> {
    let row_id = staging.row_id.as_ref().ok_or_else(|| {
        LoadError::Catalog(CoreError::InvalidPlan {
            entry: target.to_string(),
            reason: format!("staging table '{}' has no row id", staging.name),
        })
    })?;

    let mut key_exprs = Vec::with_capacity(transform.natural_key.len());
    for key in &transform.natural_key {
        let expr = transform.expr_for(key).ok_or_else(|| {
            LoadError::Catalog(CoreError::InvalidPlan {
                entry: target.to_string(),
                reason: format!("natural key column '{}' is not projected", key),
            })
        })?;
        key_exprs.push(expr);
    }

    let alias = &transform.source_alias;
    let mut from = format!("{} AS {}", staging.name.quoted(), alias);
    for join in &transform.joins {
        from.push_str(&format!(
            " JOIN {} AS {} ON ({})",
            join.table.quoted(),
            join.alias,
            join.on
        ));
    }
    let filter = transform
        .filter
        .as_ref()
        .map(|f| format!(" WHERE ({f})"))
        .unwrap_or_default();

    let mut select: Vec<String> = transform
        .projection
        .iter()
        .map(|p| format!("{} AS {}", p.expr, p.column.quoted()))
        .collect();
    let mut order: Vec<String> = Vec::new();
    for (i, key) in transform.tie_break.iter().enumerate() {
        let name = quote_ident(&format!("__tb_{i}"));
        select.push(format!("{} AS {}", key.expr, name));
        let direction = match key.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        order.push(format!("{name} {direction} NULLS LAST"));
    }
    select.push(format!("{alias}.{} AS {}", row_id.quoted(), quote_ident(ROW_ID)));
    order.push(format!("{} DESC", quote_ident(ROW_ID)));

    let columns: Vec<ColumnName> = transform
        .projection
        .iter()
        .map(|p| p.column.clone())
        .collect();
    let key_list = quoted_list(&transform.natural_key);

    let sql = format!(
        "SELECT {cols} FROM (\
         SELECT *, ROW_NUMBER() OVER (PARTITION BY {key_list} ORDER BY {order}) AS {rank} \
         FROM (SELECT {select} FROM {from}{filter}) AS projected\
         ) AS ranked WHERE {rank} = 1 ORDER BY {key_list}",
        cols = quoted_list(&columns),
        order = order.join(", "),
        rank = quote_ident(RANK),
        select = select.join(", "),
    );

    let candidate_sql = format!(
        "SELECT DISTINCT {} FROM {} AS {alias}{filter}",
        key_exprs.join(", "),
        staging.name.quoted(),
    );

    log::trace!("{target} canonical rows: {sql}");
    Ok(CanonicalRows {
        target: target.clone(),
        columns,
        natural_key: transform.natural_key.clone(),
        sql,
        candidate_sql,
    })
}

#[cfg(test)]
#[path = "dedup_test.rs"]
mod tests;
