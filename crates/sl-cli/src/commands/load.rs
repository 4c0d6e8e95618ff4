//! Load command implementation

use anyhow::{Context, Result};
use serde::Serialize;
use sl_core::{Checkpoint, Stage};
use sl_db::DuckDbPool;
use sl_load::{CancelToken, LoadError, LoadOptions, Orchestrator};
use std::fmt::Write;

use crate::cli::{GlobalArgs, LoadArgs, OutputFormat};
use crate::commands::common::{build_plan, load_catalog, load_config, ExitCode, RunStatus};

/// Execute the load command
pub async fn execute(args: &LoadArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let catalog = load_catalog()?;
    let plan = build_plan(&config, &catalog)?;
    let pool = DuckDbPool::new(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path))?;

    let mut options = LoadOptions::from_config(&config);
    if args.parallel {
        options.parallel_dimensions = true;
    }

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping after the current table");
                cancel.cancel();
            }
        })
    };

    log::info!(
        "Loading '{}' into {}",
        config.name,
        config.database.path
    );
    let result = Orchestrator::new(&pool, &catalog, options)
        .with_cancel_token(cancel)
        .run_load(&plan)
        .await;
    interrupt.abort();

    match result {
        Ok(report) => {
            let output = RunOutput {
                run_id: &report.run_id,
                status: RunStatus::Success,
                failed_stage: None,
                error: None,
                duration_secs: Some(report.duration_secs()),
                total_unmatched: report.total_unmatched(),
                checkpoints: &report.checkpoints,
            };
            print_output(&output, args.output)
        }
        Err(failure) => {
            let output = RunOutput {
                run_id: &failure.run_id,
                status: RunStatus::Failed,
                failed_stage: Some(failure.stage),
                error: Some(failure.reason.to_string()),
                duration_secs: None,
                total_unmatched: failure.checkpoints.iter().map(|c| c.unmatched).sum(),
                checkpoints: &failure.checkpoints,
            };
            print_output(&output, args.output)?;
            if matches!(failure.reason, LoadError::TargetUnavailable { .. }) {
                eprintln!("Hint: run `starload setup` to create the warehouse tables");
            }
            Err(ExitCode(exit_code(&failure.reason)).into())
        }
    }
}

/// Report printed for a finished or failed run
#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    run_id: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
    total_unmatched: u64,
    checkpoints: &'a [Checkpoint],
}

fn print_output(output: &RunOutput<'_>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", render_text(output)),
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(output).context("Failed to serialize load report")?;
            println!("{json}");
        }
    }
    Ok(())
}

fn render_text(output: &RunOutput<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<13} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "TABLE", "STAGE", "BEFORE", "AFTER", "ADDED", "SOURCE", "UNMATCHED"
    );
    for cp in output.checkpoints {
        let _ = writeln!(
            out,
            "{:<16} {:<13} {:>10} {:>10} {:>10} {:>10} {:>10}",
            cp.table.as_str(),
            cp.stage.to_string(),
            cp.rows_before,
            cp.row_count,
            cp.rows_added(),
            cp.source_rows,
            cp.unmatched
        );
    }
    out.push('\n');

    match (&output.status, output.failed_stage, &output.error) {
        (RunStatus::Failed, Some(stage), Some(error)) => {
            let _ = writeln!(out, "Run {} failed during {stage}: {error}", output.run_id);
        }
        _ => {
            let _ = write!(out, "Run {} {}", output.run_id, output.status);
            if let Some(secs) = output.duration_secs {
                let _ = write!(out, " in {secs:.1}s");
            }
            out.push('\n');
        }
    }
    if output.total_unmatched > 0 {
        let _ = writeln!(
            out,
            "{} candidate rows had no matching dimension row",
            output.total_unmatched
        );
    }
    out
}

/// Process exit code for a failed run
fn exit_code(reason: &LoadError) -> i32 {
    match reason {
        LoadError::Cancelled => 130,
        _ => 1,
    }
}

#[cfg(test)]
#[path = "load_test.rs"]
mod tests;
