//! DDL rendering for catalog tables.
//!
//! Distribution and sort keys are physical hints for MPP warehouses; the
//! embedded backend has no equivalent, so they are rendered as a trailing
//! comment only.

use crate::catalog::TableSpec;
use crate::sql_utils::{quote_ident, quote_literal, quoted_list};

/// Name of the sequence backing a staging table's row identifier
pub fn row_id_sequence(spec: &TableSpec) -> String {
    format!("{}_row_id_seq", spec.name)
}

/// `CREATE TABLE IF NOT EXISTS` for a table, preceded by its row id sequence
pub fn create_table_sql(spec: &TableSpec) -> String {
    let mut sql = String::new();
    let sequence = spec.row_id.as_ref().map(|_| row_id_sequence(spec));
    if let Some(seq) = &sequence {
        sql.push_str(&format!(
            "CREATE SEQUENCE IF NOT EXISTS {} START 1;\n",
            quote_ident(seq)
        ));
    }

    let mut lines: Vec<String> = spec
        .columns
        .iter()
        .map(|col| {
            let mut line = format!("    {} {}", col.name.quoted(), col.data_type);
            if Some(&col.name) == spec.row_id.as_ref() {
                if let Some(seq) = &sequence {
                    line.push_str(&format!(" DEFAULT nextval({})", quote_literal(seq)));
                }
            }
            if !col.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    let key = spec.primary_key();
    if !key.is_empty() {
        lines.push(format!("    PRIMARY KEY ({})", quoted_list(key)));
    }

    sql.push_str(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        spec.name.quoted(),
        lines.join(",\n")
    ));
    sql.push(';');
    if let Some(hints) = physical_hints(spec) {
        sql.push_str(&format!(" -- {}", hints));
    }
    sql
}

/// `DROP TABLE IF EXISTS` for a table, followed by its row id sequence
pub fn drop_table_sql(spec: &TableSpec) -> String {
    let mut sql = format!("DROP TABLE IF EXISTS {};", spec.name.quoted());
    if spec.row_id.is_some() {
        sql.push_str(&format!(
            "\nDROP SEQUENCE IF EXISTS {};",
            quote_ident(&row_id_sequence(spec))
        ));
    }
    sql
}

/// Remove every row from a table, keeping its definition
pub fn truncate_sql(spec: &TableSpec) -> String {
    format!("DELETE FROM {}", spec.name.quoted())
}

/// Human-readable distribution/sort hints, `None` when the table has neither
pub fn physical_hints(spec: &TableSpec) -> Option<String> {
    let mut parts = Vec::new();
    match &spec.dist_key {
        Some(col) => parts.push(format!("distkey({})", col)),
        None if !spec.is_staging() => parts.push("diststyle all".to_string()),
        None => {}
    }
    if !spec.sort_key.is_empty() {
        let cols: Vec<&str> = spec.sort_key.iter().map(|c| c.as_str()).collect();
        parts.push(format!("sortkey({})", cols.join(", ")));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}
