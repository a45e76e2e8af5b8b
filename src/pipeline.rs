//! One batch run, from lock acquisition to the final summary.

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use gavel_common::{ItemState, StateMachine};

use crate::config::GavelConfig;
use crate::errors::Result;
use crate::ledger::Ledger;
use crate::lock::RunLock;
use crate::runner::{RunPolicy, RunSummary, StageRunner};
use crate::stages::{SourceScope, Stages};
use crate::store::DurableStore;
use crate::upload::UploadWorker;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub scope: SourceScope,
    /// Run every stage but never write the pipeline store.
    pub dry_run: bool,
}

/// Execute one batch run.
///
/// The run lock is held until this returns, on every path. Per-item stage
/// failures are recorded in the store and reflected in the summary; only
/// run-level failures come back as errors.
pub async fn run_batch(
    config: &GavelConfig,
    stages: Arc<dyn Stages>,
    options: RunOptions,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", run_id = %run_id, scope = %options.scope);
    execute(config, stages, options).instrument(span).await
}

async fn execute(
    config: &GavelConfig,
    stages: Arc<dyn Stages>,
    options: RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let _lock = RunLock::new(&config.lock.path)
        .acquire_async(config.lock_wait())
        .await?;

    let mut store = DurableStore::new(&config.store.path);
    if options.dry_run {
        info!("Dry run: the pipeline store will not be updated");
        store = store.read_only();
    }
    let ledger = Arc::new(Ledger::open(
        store,
        StateMachine::new(config.policy.max_retries),
    )?);

    let policy = RunPolicy::from_config(config, options.scope, started);
    let mut runner = StageRunner::new(Arc::clone(&ledger), Arc::clone(&stages), policy);
    runner.discover().await?;
    runner.apply_cutoff()?;

    let worker = UploadWorker::spawn(Arc::clone(&ledger), stages);
    let outcome = drive(&mut runner, &worker).await;
    if let Err(e) = &outcome {
        warn!(error = %e, "Stopping run, waiting for queued uploads");
    }
    let report = worker.finish(config.upload_drain_timeout()).await;

    let mut summary = runner.into_summary();
    summary.uploaded = report.uploaded;
    summary.upload_failed = report.failed;
    summary.abandoned_uploads = report.abandoned;
    log_summary(&summary, &ledger, started);

    outcome?;
    if let Some(e) = report.error {
        return Err(e);
    }
    Ok(summary)
}

async fn drive(runner: &mut StageRunner, worker: &UploadWorker) -> Result<()> {
    // Retry first so failed uploads land back in `uploading` before the
    // interrupted uploads are re-queued.
    runner.retry_failed()?;
    runner.resume_uploads(worker)?;
    runner.run(worker).await
}

fn log_summary(summary: &RunSummary, ledger: &Ledger, started: Instant) {
    let counts = ledger.counts();
    let count = |state: ItemState| counts.get(&state).copied().unwrap_or(0);
    info!(
        discovered = summary.discovered,
        new = summary.new_items,
        skipped = summary.skipped,
        retried = summary.retried,
        advanced = ?summary.advanced,
        failed = summary.failed,
        uploaded = summary.uploaded,
        upload_failed = summary.upload_failed,
        abandoned_uploads = summary.abandoned_uploads,
        deadline_hit = summary.deadline_hit,
        elapsed_secs = started.elapsed().as_secs(),
        "Run summary"
    );
    info!(
        total = ledger.len(),
        uploaded = count(ItemState::Uploaded),
        skipped = count(ItemState::Skipped),
        failed = count(ItemState::Failed),
        "Store totals"
    );
}
