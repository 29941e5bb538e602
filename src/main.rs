//! kv-tier-sim: replay a step trace against KV-cache placement and migration
//! policies over a fast/far memory hierarchy and report the modeled time.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use kv_tier_sim::config::{Cli, Config};
use kv_tier_sim::sim::experiment::Experiment;
use kv_tier_sim::sim::report;
use kv_tier_sim::trace::Trace;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_tier_sim=debug"
    } else {
        "kv_tier_sim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-tier-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    config.apply_cli(&cli);
    config.validate().context("validating configuration")?;
    let config = Arc::new(config);

    info!(
        n_layers = config.model.n_layers,
        prefill_tokens = config.model.prefill_tokens,
        decode_tokens = config.model.decode_tokens,
        fast_capacity = config.tiers.fast_capacity,
        best_alpha = config.best_alpha(),
        accounting = ?config.tiers.accounting,
        "Configuration loaded"
    );

    // Load the trace.
    let trace_path = &config.run.trace_path;
    let trace = Trace::load(trace_path)
        .with_context(|| format!("loading trace {}", trace_path.display()))?;
    trace
        .check_layers(config.model.n_layers)
        .with_context(|| format!("checking trace {}", trace_path.display()))?;
    info!(records = trace.len(), path = %trace_path.display(), "Trace loaded");

    // Run the upper bound and every combination.
    let experiment = Experiment::new(config.clone(), Arc::new(trace));
    let report = experiment.run();

    if let Some(best) = report.best_run() {
        info!(
            placement = %best.placement,
            migration = %best.migration,
            total_time_ns = best.outcome.total_time,
            upper_bound_ns = report.upper_bound.total_time,
            "Fastest combination"
        );
    }

    // Write outputs.
    let log_path = &config.run.log_path;
    report::write_log_file(log_path, &report, config.model.decode_tokens)
        .with_context(|| format!("writing run log {}", log_path.display()))?;
    info!(path = %log_path.display(), "Run log written");

    if let Some(summary_path) = &config.run.summary_path {
        report::write_summary(summary_path, &report)
            .with_context(|| format!("writing summary {}", summary_path.display()))?;
        info!(path = %summary_path.display(), "Summary written");
    }

    Ok(())
}
