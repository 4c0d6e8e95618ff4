//! Plan command implementation

use anyhow::{Context, Result};
use serde::Serialize;
use sl_core::{ddl, LoadEntry, LoadPlan, SchemaCatalog, TableKind};
use std::fmt::Write;

use crate::cli::{GlobalArgs, OutputFormat, PlanArgs};
use crate::commands::common::{build_plan, load_catalog, load_config};

/// Execute the plan command
pub async fn execute(args: &PlanArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let catalog = load_catalog()?;
    let plan = build_plan(&config, &catalog)?;

    match args.output {
        OutputFormat::Text => print!("{}", render_text(&catalog, &plan)),
        OutputFormat::Json => {
            let output = PlanOutput::new(&catalog, &plan);
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialize plan")?;
            println!("{json}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
    order: Vec<TableSummary<'a>>,
    plan: &'a LoadPlan,
}

#[derive(Debug, Serialize)]
struct TableSummary<'a> {
    name: &'a str,
    kind: TableKind,
    references: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hints: Option<String>,
}

impl<'a> PlanOutput<'a> {
    fn new(catalog: &'a SchemaCatalog, plan: &'a LoadPlan) -> Self {
        let order = catalog
            .dependency_order()
            .into_iter()
            .map(|spec| {
                let mut references: Vec<&str> = Vec::new();
                for (_, fk) in spec.foreign_keys() {
                    if !references.contains(&fk.table.as_str()) {
                        references.push(fk.table.as_str());
                    }
                }
                TableSummary {
                    name: spec.name.as_str(),
                    kind: spec.kind,
                    references,
                    hints: ddl::physical_hints(spec),
                }
            })
            .collect();
        Self { order, plan }
    }
}

fn render_text(catalog: &SchemaCatalog, plan: &LoadPlan) -> String {
    let output = PlanOutput::new(catalog, plan);
    let mut out = String::new();

    let _ = writeln!(out, "Dependency order:");
    for (i, table) in output.order.iter().enumerate() {
        let _ = write!(
            out,
            "  {:>2}. {:<16} {:<10}",
            i + 1,
            table.name,
            table.kind.to_string()
        );
        if !table.references.is_empty() {
            let _ = write!(out, " -> {}", table.references.join(", "));
        }
        out.push('\n');
    }

    let _ = writeln!(out, "\nLoad plan ({} entries):", plan.len());
    for entry in plan.entries() {
        let _ = writeln!(out, "  {}", describe_entry(entry));
    }
    out
}

fn describe_entry(entry: &LoadEntry) -> String {
    match entry {
        LoadEntry::Staging { target, source } => {
            let mut line = format!("{:<16} <- {} ({})", target.as_str(), source.uri, source.format);
            if let Some(credential) = &source.credential_ref {
                let _ = write!(line, " using {credential}");
            }
            line
        }
        LoadEntry::Table {
            source,
            target,
            transform,
        } => {
            let mut line = format!("{:<16} <- {}", target.as_str(), source);
            for join in &transform.joins {
                let _ = write!(line, " + {}", join.table);
            }
            let key: Vec<&str> = transform.natural_key.iter().map(|c| c.as_str()).collect();
            let _ = write!(line, " key({}) {}", key.join(", "), transform.policy);
            line
        }
    }
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod tests;
