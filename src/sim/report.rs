//! Run outputs: the line-oriented text log and an optional JSON summary.
//!
//! Log layout:
//!
//! ```text
//! Best Combination:
//! Total simulation time: <ns> ns, <s> seconds
//! Average time per token: <ns> ns, <s> seconds
//! --------------------------------------------------
//! Combination: <Placement> + <Migration>
//! Total time: <ns> ns, <s> seconds
//! Avg alpha: <alpha>
//! Alphas:
//! <alpha>
//! ...
//! --------------------------------------------------
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::policy::migration::MigrationKind;
use crate::policy::placement::PlacementKind;
use crate::sim::experiment::ExperimentReport;

const SEPARATOR_WIDTH: usize = 50;
const NS_PER_SECOND: f64 = 1e9;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize summary: {0}")]
    Json(#[from] serde_json::Error),
}

fn separator(out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "{}", "-".repeat(SEPARATOR_WIDTH))
}

/// Write the text log for `report`; `decode_tokens` scales the per-token average.
pub fn write_log(
    out: &mut impl Write,
    report: &ExperimentReport,
    decode_tokens: u64,
) -> std::io::Result<()> {
    let total = report.upper_bound.total_time;
    let per_token = if decode_tokens == 0 {
        0.0
    } else {
        total / decode_tokens as f64
    };
    writeln!(out, "Best Combination:")?;
    writeln!(
        out,
        "Total simulation time: {:.4} ns, {:.4} seconds",
        total,
        total / NS_PER_SECOND
    )?;
    writeln!(
        out,
        "Average time per token: {:.4} ns, {:.4} seconds",
        per_token,
        per_token / NS_PER_SECOND
    )?;
    separator(out)?;

    for run in &report.runs {
        let outcome = &run.outcome;
        writeln!(out, "Combination: {} + {}", run.placement, run.migration)?;
        writeln!(
            out,
            "Total time: {:.4} ns, {:.4} seconds",
            outcome.total_time,
            outcome.total_time / NS_PER_SECOND
        )?;
        writeln!(out, "Avg alpha: {:.6}", outcome.average_alpha())?;
        writeln!(out, "Alphas:")?;
        for alpha in outcome.alphas() {
            writeln!(out, "{alpha:.4}")?;
        }
        separator(out)?;
    }
    Ok(())
}

/// Write the text log to a file, replacing it.
pub fn write_log_file(
    path: &Path,
    report: &ExperimentReport,
    decode_tokens: u64,
) -> Result<(), ReportError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_log(&mut out, report, decode_tokens)?;
    out.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct CombinationSummary {
    placement: PlacementKind,
    migration: MigrationKind,
    total_time_ns: f64,
    average_alpha: f64,
    alphas: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct Summary {
    upper_bound_time_ns: f64,
    upper_bound_average_alpha: f64,
    combinations: Vec<CombinationSummary>,
}

impl From<&ExperimentReport> for Summary {
    fn from(report: &ExperimentReport) -> Self {
        Self {
            upper_bound_time_ns: report.upper_bound.total_time,
            upper_bound_average_alpha: report.upper_bound.average_alpha(),
            combinations: report
                .runs
                .iter()
                .map(|run| CombinationSummary {
                    placement: run.placement,
                    migration: run.migration,
                    total_time_ns: run.outcome.total_time,
                    average_alpha: run.outcome.average_alpha(),
                    alphas: run.outcome.alphas().collect(),
                })
                .collect(),
        }
    }
}

/// Write the JSON summary to a file, replacing it.
pub fn write_summary(path: &Path, report: &ExperimentReport) -> Result<(), ReportError> {
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, &Summary::from(report))?;
    out.flush()?;
    Ok(())
}
