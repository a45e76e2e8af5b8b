//! Batch execution (`gavel run`).

use std::sync::Arc;

use anyhow::Result;
use console::style;

use gavel::common::Stage;
use gavel::config::GavelConfig;
use gavel::pipeline::{RunOptions, run_batch};
use gavel::stages::{CommandStages, SourceScope};

pub async fn cmd_run(config: &GavelConfig, scope: SourceScope, dry_run: bool) -> Result<()> {
    config.require_runnable()?;
    for warning in config.validate() {
        tracing::warn!(warning = %warning, "Configuration warning");
    }

    let stages = Arc::new(CommandStages::from_config(config));
    let summary = run_batch(config, stages, RunOptions { scope, dry_run }).await?;

    println!();
    println!("{}", style("Run complete").bold());
    println!("  discovered   {} ({} new)", summary.discovered, summary.new_items);
    for stage in Stage::PROCESSING {
        println!("  {:<12} {}", stage.as_str(), summary.advanced(stage));
    }
    println!("  {:<12} {}", "uploaded", style(summary.uploaded).green());
    println!("  {:<12} {}", "skipped", summary.skipped);
    println!("  {:<12} {}", "retried", summary.retried);
    let failed = summary.failed + summary.upload_failed;
    if failed > 0 {
        println!("  {:<12} {}", "failed", style(failed).red());
    } else {
        println!("  {:<12} {}", "failed", failed);
    }
    if summary.abandoned_uploads > 0 {
        println!(
            "  {}",
            style(format!(
                "{} upload(s) left for the next run",
                summary.abandoned_uploads
            ))
            .yellow()
        );
    }
    if summary.deadline_hit {
        println!("  {}", style("stopped early: run deadline reached").yellow());
    }
    if dry_run {
        println!("  {}", style("dry run: pipeline store not updated").dim());
    }
    Ok(())
}
