//! Store inspection for `gavel status` and `gavel show`.
//!
//! Both open the store read-only and never take the run lock, so they are
//! safe to use while a run is in progress.

use anyhow::{Context, Result};
use console::style;

use gavel::common::{ItemState, StateMachine};
use gavel::config::GavelConfig;
use gavel::errors::PipelineError;
use gavel::ledger::Ledger;
use gavel::store::DurableStore;

fn open_ledger(config: &GavelConfig) -> Result<Ledger> {
    let store = DurableStore::new(&config.store.path).read_only();
    let ledger = Ledger::open(store, StateMachine::new(config.policy.max_retries))?;
    Ok(ledger)
}

pub fn cmd_status(config: &GavelConfig) -> Result<()> {
    let ledger = open_ledger(config)?;
    let counts = ledger.counts();

    println!();
    println!(
        "{} {}",
        style("Pipeline store:").bold(),
        config.store.path.display()
    );
    println!();

    for state in ItemState::ALL {
        let count = counts.get(&state).copied().unwrap_or(0);
        let label = format!("{:<14}", state.as_str());
        let line = match state {
            ItemState::Uploaded if count > 0 => format!("{} {}", label, style(count).green()),
            ItemState::Failed if count > 0 => format!("{} {}", label, style(count).red()),
            _ if count == 0 => format!("{}", style(format!("{} {}", label, count)).dim()),
            _ => format!("{} {}", label, count),
        };
        println!("  {}", line);
    }

    let failed = ledger.list_by_state(ItemState::Failed);
    let permanent = failed
        .iter()
        .filter(|r| ledger.machine().is_permanently_failed(r))
        .count();
    println!();
    println!("  {:<14} {}", "total", ledger.len());
    if !failed.is_empty() {
        println!(
            "  {:<14} {} retryable, {} permanent (max_retries = {})",
            "failures",
            failed.len() - permanent,
            permanent,
            ledger.machine().max_retries()
        );
    }
    println!();
    Ok(())
}

pub fn cmd_show(config: &GavelConfig, id: &str) -> Result<()> {
    let ledger = open_ledger(config)?;
    let record = ledger
        .get(id)
        .ok_or_else(|| PipelineError::UnknownItem { id: id.to_string() })?;
    let json = serde_json::to_string_pretty(&record).context("Failed to serialize record")?;
    println!("{}", json);
    Ok(())
}
