//! Background upload worker.
//!
//! One tokio task consumes item ids from an unbounded queue and runs the
//! upload stage for each while the runner keeps working on earlier stages.
//! Items only ever enter the queue in `uploading`; whatever the worker has
//! not finished when the drain timeout expires stays there for the next run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gavel_common::{ItemState, ReservedKey, Stage, StatePatch};

use crate::errors::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::stages::{StageError, Stages};

/// What the worker did during one run.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Enqueued items still in `uploading` when the worker stopped.
    pub abandoned: usize,
    pub timed_out: bool,
    /// Run-level error that stopped the worker early.
    pub error: Option<PipelineError>,
}

enum UploadOutcome {
    Uploaded,
    Failed,
    NotUploading,
}

pub struct UploadWorker {
    ledger: Arc<Ledger>,
    tx: mpsc::UnboundedSender<String>,
    handle: JoinHandle<()>,
    report: Arc<Mutex<WorkerReport>>,
    enqueued: Mutex<Vec<String>>,
}

impl UploadWorker {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(ledger: Arc<Ledger>, stages: Arc<dyn Stages>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let report = Arc::new(Mutex::new(WorkerReport::default()));
        let handle = tokio::spawn(worker_loop(
            Arc::clone(&ledger),
            stages,
            rx,
            Arc::clone(&report),
        ));
        Self {
            ledger,
            tx,
            handle,
            report,
            enqueued: Mutex::new(Vec::new()),
        }
    }

    /// Hand an item that is already in `uploading` to the worker.
    pub fn enqueue(&self, id: &str) -> Result<()> {
        self.tx
            .send(id.to_string())
            .map_err(|_| PipelineError::UploadWorker("upload queue is closed".to_string()))?;
        self.enqueued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string());
        debug!(id, "Queued for upload");
        Ok(())
    }

    /// Whether the worker stopped on its own because of a run-level error.
    pub fn has_stopped(&self) -> bool {
        self.handle.is_finished()
    }

    /// Close the queue and wait up to `drain_timeout` for the worker to empty
    /// it. On timeout the worker is aborted mid-upload.
    pub async fn finish(self, drain_timeout: Duration) -> WorkerReport {
        let UploadWorker {
            ledger,
            tx,
            mut handle,
            report,
            enqueued,
        } = self;
        drop(tx);

        let timed_out = match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(error = %e, "Upload worker task ended abnormally");
                false
            }
            Err(_) => {
                warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "Upload drain timed out, leaving remaining items in uploading"
                );
                handle.abort();
                let _ = handle.await;
                true
            }
        };

        let mut report = std::mem::take(&mut *report.lock().unwrap_or_else(PoisonError::into_inner));
        report.timed_out = timed_out;

        let mut ids = enqueued.into_inner().unwrap_or_else(PoisonError::into_inner);
        ids.sort();
        ids.dedup();
        report.abandoned = ids
            .iter()
            .filter(|id| ledger.get(id).is_some_and(|r| r.state == ItemState::Uploading))
            .count();
        report
    }
}

async fn worker_loop(
    ledger: Arc<Ledger>,
    stages: Arc<dyn Stages>,
    mut rx: mpsc::UnboundedReceiver<String>,
    report: Arc<Mutex<WorkerReport>>,
) {
    while let Some(id) = rx.recv().await {
        let outcome = upload_one(&ledger, stages.as_ref(), &id).await;
        let mut summary = report.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(UploadOutcome::Uploaded) => summary.uploaded += 1,
            Ok(UploadOutcome::Failed) => summary.failed += 1,
            Ok(UploadOutcome::NotUploading) => {}
            Err(e) => {
                error!(id = %id, error = %e, "Upload worker stopping");
                summary.error = Some(e);
                break;
            }
        }
    }
}

async fn upload_one(ledger: &Ledger, stages: &dyn Stages, id: &str) -> Result<UploadOutcome> {
    let Some(record) = ledger.get(id) else {
        return Err(PipelineError::UnknownItem { id: id.to_string() });
    };
    if record.state != ItemState::Uploading {
        warn!(id, state = %record.state, "Skipping upload for item no longer in uploading");
        return Ok(UploadOutcome::NotUploading);
    }

    let document = record.reserved_str(ReservedKey::DocumentPath).map(PathBuf::from);
    let artifact = record.reserved_str(ReservedKey::ArtifactPath).map(PathBuf::from);
    let (document, artifact) = match (document, artifact) {
        (Some(d), Some(a)) => (d, a),
        (None, _) => return fail(ledger, id, "missing document_path"),
        (_, None) => return fail(ledger, id, "missing artifact_path"),
    };

    match stages.upload(id, &document, &artifact).await {
        Ok(location) => {
            ledger.set_state(
                id,
                ItemState::Uploaded,
                StatePatch::new().with(ReservedKey::UploadLocation, location.clone()),
            )?;
            info!(id, location = %location, "Uploaded");
            Ok(UploadOutcome::Uploaded)
        }
        Err(StageError::Fatal(reason)) => Err(PipelineError::StageFatal {
            stage: Stage::Upload,
            id: id.to_string(),
            reason,
        }),
        Err(StageError::Retryable(reason)) => fail(ledger, id, &reason),
    }
}

fn fail(ledger: &Ledger, id: &str, reason: &str) -> Result<UploadOutcome> {
    let record = ledger.set_state(id, ItemState::Failed, StatePatch::failure(Stage::Upload, reason))?;
    warn!(id, reason, retry_count = record.retry_count, "Upload failed");
    Ok(UploadOutcome::Failed)
}
