//! Typed error hierarchy for the gavel engine.
//!
//! `PipelineError` covers every run-level failure; per-item stage failures
//! are recorded on the item and never surface here. `ExitStatus` maps the
//! outcome of a run to the process exit code.

use std::path::PathBuf;

use gavel_common::{InvalidTransition, ItemState, Stage};
use thiserror::Error;

/// Errors from the ledger, store, lock and runner.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Item {id} not found in the pipeline store")]
    UnknownItem { id: String },

    #[error("Transition of item {id} into failed carries no failure reason")]
    MissingFailureReason { id: String },

    #[error("Pipeline store at {path} is corrupted (primary: {primary}; backup: {backup})")]
    StoreCorrupted {
        path: PathBuf,
        primary: String,
        backup: String,
    },

    #[error("Failed to persist pipeline store at {path}: {source}")]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another run holds the lock at {path}")]
    Busy { path: PathBuf },

    #[error("Failed to open run lock at {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery failed: {0}")]
    DiscoveryFailure(String),

    #[error("Fatal {stage} failure on item {id}: {reason}")]
    StageFatal {
        stage: Stage,
        id: String,
        reason: String,
    },

    #[error("Item {id} is in {state}, which has no {stage} input")]
    UnexpectedState {
        id: String,
        state: ItemState,
        stage: Stage,
    },

    #[error("Upload worker stopped: {0}")]
    UploadWorker(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Process exit status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Unexpected,
    FatalConfiguration,
    AlreadyRunning,
    StoreCorrupted,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Unexpected => 1,
            ExitStatus::FatalConfiguration => 2,
            ExitStatus::AlreadyRunning => 3,
            ExitStatus::StoreCorrupted => 4,
        }
    }

    /// Classify an error bubbled up from a run. Typed pipeline errors are
    /// looked up anywhere in the anyhow chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<PipelineError>()) {
            Some(PipelineError::Busy { .. }) => ExitStatus::AlreadyRunning,
            Some(PipelineError::StoreCorrupted { .. }) => ExitStatus::StoreCorrupted,
            Some(PipelineError::DiscoveryFailure(_)) | Some(PipelineError::StageFatal { .. }) => {
                ExitStatus::FatalConfiguration
            }
            Some(_) => ExitStatus::Unexpected,
            None if err.chain().any(|e| e.is::<crate::config::ConfigError>()) => {
                ExitStatus::FatalConfiguration
            }
            None => ExitStatus::Unexpected,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}
