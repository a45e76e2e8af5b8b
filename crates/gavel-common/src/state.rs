use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of one tracked item.
///
/// The processing chain is `discovered → downloading → downloaded →
/// transcribing → transcribed → qc_checked → formatted → uploading →
/// uploaded`, with `skipped` and `failed` as side exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Discovered,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    QcChecked,
    Formatted,
    Uploading,
    Uploaded,
    Skipped,
    Failed,
}

use ItemState::*;

/// States a failed item may be sent back to, i.e. every state with a `failed` edge.
const RETRY_TARGETS: [ItemState; 8] = [
    Discovered,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    QcChecked,
    Formatted,
    Uploading,
];

impl ItemState {
    pub const ALL: [ItemState; 11] = [
        Discovered,
        Downloading,
        Downloaded,
        Transcribing,
        Transcribed,
        QcChecked,
        Formatted,
        Uploading,
        Uploaded,
        Skipped,
        Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Discovered => "discovered",
            Downloading => "downloading",
            Downloaded => "downloaded",
            Transcribing => "transcribing",
            Transcribed => "transcribed",
            QcChecked => "qc_checked",
            Formatted => "formatted",
            Uploading => "uploading",
            Uploaded => "uploaded",
            Skipped => "skipped",
            Failed => "failed",
        }
    }

    /// The fixed adjacency table.
    ///
    /// `failed` lists every possible retry target here; which one is actually
    /// legal for a given record (and whether the retry cap still allows it) is
    /// decided by [`crate::StateMachine`].
    pub fn successors(&self) -> &'static [ItemState] {
        match self {
            Discovered => &[Downloading, Skipped, Failed],
            Downloading => &[Downloaded, Skipped, Failed],
            Downloaded => &[Transcribing, Skipped, Failed],
            Transcribing => &[Transcribed, Skipped, Failed],
            Transcribed => &[QcChecked, Skipped, Failed],
            QcChecked => &[Formatted, Skipped, Failed],
            Formatted => &[Uploading, Skipped, Failed],
            Uploading => &[Uploaded, Skipped, Failed],
            Failed => &RETRY_TARGETS,
            Uploaded | Skipped => &[],
        }
    }

    /// Pure edge membership, ignoring retry policy.
    pub fn can_reach(&self, next: ItemState) -> bool {
        self.successors().contains(&next)
    }

    /// `uploaded` and `skipped` never move again. `failed` is only terminal
    /// once its retries are used up, which needs the record to decide.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Uploaded | Skipped)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown item state '{0}'")]
pub struct UnknownState(pub String);

impl std::str::FromStr for ItemState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// One named processing step with a fixed external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Download,
    Transcribe,
    QualityCheck,
    Format,
    Upload,
}

impl Stage {
    /// Stages the runner drives itself, in pipeline order. Upload is owned by
    /// the background worker and discovery runs once per batch.
    pub const PROCESSING: [Stage; 4] = [
        Stage::Download,
        Stage::Transcribe,
        Stage::QualityCheck,
        Stage::Format,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Download => "download",
            Stage::Transcribe => "transcribe",
            Stage::QualityCheck => "quality_check",
            Stage::Format => "format",
            Stage::Upload => "upload",
        }
    }

    /// State an item must be in for this stage to pick it up.
    pub fn input_state(&self) -> Option<ItemState> {
        match self {
            Stage::Discover => None,
            Stage::Download => Some(Discovered),
            Stage::Transcribe => Some(Downloaded),
            Stage::QualityCheck => Some(Transcribed),
            Stage::Format => Some(QcChecked),
            Stage::Upload => Some(Formatted),
        }
    }

    /// The "-ing" state held while the external call runs, if the stage has one.
    pub fn active_state(&self) -> Option<ItemState> {
        match self {
            Stage::Download => Some(Downloading),
            Stage::Transcribe => Some(Transcribing),
            Stage::Upload => Some(Uploading),
            Stage::Discover | Stage::QualityCheck | Stage::Format => None,
        }
    }

    /// State committed when the stage succeeds.
    pub fn output_state(&self) -> Option<ItemState> {
        match self {
            Stage::Discover => None,
            Stage::Download => Some(Downloaded),
            Stage::Transcribe => Some(Transcribed),
            Stage::QualityCheck => Some(QcChecked),
            Stage::Format => Some(Formatted),
            Stage::Upload => Some(Uploaded),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
