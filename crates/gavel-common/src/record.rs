use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::state::{ItemState, Stage};

/// Per-item metadata. Ordered so the persisted table serialises identically
/// every time it is saved.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata keys owned by the engine. Descriptive metadata can never
/// overwrite these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReservedKey {
    DiscoveredAt,
    StateChangedAt,
    FailureReason,
    FailureStage,
    FailedFrom,
    SkipReason,
    ArtifactPath,
    TranscriptPath,
    QcPassed,
    QcIssues,
    DocumentPath,
    UploadLocation,
    MigratedFrom,
}

impl ReservedKey {
    pub const ALL: [ReservedKey; 13] = [
        ReservedKey::DiscoveredAt,
        ReservedKey::StateChangedAt,
        ReservedKey::FailureReason,
        ReservedKey::FailureStage,
        ReservedKey::FailedFrom,
        ReservedKey::SkipReason,
        ReservedKey::ArtifactPath,
        ReservedKey::TranscriptPath,
        ReservedKey::QcPassed,
        ReservedKey::QcIssues,
        ReservedKey::DocumentPath,
        ReservedKey::UploadLocation,
        ReservedKey::MigratedFrom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservedKey::DiscoveredAt => "discovered_at",
            ReservedKey::StateChangedAt => "state_changed_at",
            ReservedKey::FailureReason => "failure_reason",
            ReservedKey::FailureStage => "failure_stage",
            ReservedKey::FailedFrom => "failed_from",
            ReservedKey::SkipReason => "skip_reason",
            ReservedKey::ArtifactPath => "artifact_path",
            ReservedKey::TranscriptPath => "transcript_path",
            ReservedKey::QcPassed => "qc_passed",
            ReservedKey::QcIssues => "qc_issues",
            ReservedKey::DocumentPath => "document_path",
            ReservedKey::UploadLocation => "upload_location",
            ReservedKey::MigratedFrom => "migrated_from",
        }
    }

    pub fn is_reserved(key: &str) -> bool {
        ReservedKey::ALL.iter().any(|k| k.as_str() == key)
    }
}

/// One history entry. History is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ItemState,
    pub to: ItemState,
    pub at: DateTime<Utc>,
}

/// Metadata changes that travel with a state transition.
///
/// Reserved keys can only be set through the typed constructors, so anything
/// arriving from an external source goes through [`StatePatch::describe`] and
/// loses any collision with an engine-owned key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    reserved: BTreeMap<ReservedKey, Value>,
    descriptive: Metadata,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure details required on every transition into `failed`.
    pub fn failure(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new()
            .with(ReservedKey::FailureStage, stage.as_str())
            .with(ReservedKey::FailureReason, reason.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::new().with(ReservedKey::SkipReason, reason.into())
    }

    pub fn qc(passed: bool, issues: Vec<String>) -> Self {
        Self::new()
            .with(ReservedKey::QcPassed, passed)
            .with(ReservedKey::QcIssues, issues)
    }

    /// Set an engine-owned key.
    pub fn with(mut self, key: ReservedKey, value: impl Into<Value>) -> Self {
        self.reserved.insert(key, value.into());
        self
    }

    /// Set a caller-supplied descriptive key.
    pub fn describe(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.descriptive.insert(key.into(), value.into());
        self
    }

    pub fn with_descriptive(mut self, metadata: Metadata) -> Self {
        self.descriptive.extend(metadata);
        self
    }

    pub fn reserved(&self, key: ReservedKey) -> Option<&Value> {
        self.reserved.get(&key)
    }

    /// Merge into `metadata`, descriptive keys first so reserved ones always
    /// win. Returns the descriptive keys that were dropped.
    pub fn merge_into(self, metadata: &mut Metadata) -> Vec<String> {
        let mut dropped = Vec::new();
        for (key, value) in self.descriptive {
            if ReservedKey::is_reserved(&key) {
                dropped.push(key);
            } else {
                metadata.insert(key, value);
            }
        }
        for (key, value) in self.reserved {
            metadata.insert(key.as_str().to_string(), value);
        }
        dropped
    }
}

/// Persisted progress of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub state: ItemState,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub history: Vec<Transition>,
    /// Number of failed attempts recorded so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl ItemRecord {
    /// A freshly discovered item. Returns the record and any descriptive keys
    /// that collided with reserved ones.
    pub fn discovered(id: &str, descriptive: Metadata, at: DateTime<Utc>) -> (Self, Vec<String>) {
        let mut record = Self {
            id: id.to_string(),
            state: ItemState::Discovered,
            metadata: Metadata::new(),
            history: Vec::new(),
            retry_count: 0,
        };
        let stamp = at.to_rfc3339();
        let dropped = StatePatch::new()
            .with_descriptive(descriptive)
            .with(ReservedKey::DiscoveredAt, stamp.clone())
            .with(ReservedKey::StateChangedAt, stamp)
            .merge_into(&mut record.metadata);
        (record, dropped)
    }

    pub fn reserved(&self, key: ReservedKey) -> Option<&Value> {
        self.metadata.get(key.as_str())
    }

    pub fn reserved_str(&self, key: ReservedKey) -> Option<&str> {
        self.reserved(key).and_then(Value::as_str)
    }

    pub fn discovered_at(&self) -> Option<DateTime<Utc>> {
        self.reserved_str(ReservedKey::DiscoveredAt)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The most recent history entry that moved this item into `failed`.
    pub fn last_failure(&self) -> Option<&Transition> {
        self.history.iter().rev().find(|t| t.to == ItemState::Failed)
    }

    /// Descriptive string lookup (e.g. `title`, `source`, `date`).
    pub fn describe_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Apply an already-validated transition. Returns dropped descriptive keys.
    pub fn apply_transition(
        &mut self,
        next: ItemState,
        patch: StatePatch,
        at: DateTime<Utc>,
    ) -> Vec<String> {
        let from = self.state;
        self.history.push(Transition { from, to: next, at });
        self.state = next;

        let mut patch = patch.with(ReservedKey::StateChangedAt, at.to_rfc3339());
        if next == ItemState::Failed {
            self.retry_count += 1;
            patch = patch.with(ReservedKey::FailedFrom, from.as_str());
        }
        patch.merge_into(&mut self.metadata)
    }

    /// Check the history chain: it starts at `discovered`, consecutive
    /// entries link up and the last one ends in the current state. Records
    /// migrated from a legacy store start wherever the legacy state left them.
    pub fn check_history(&self) -> Result<(), String> {
        if self.reserved(ReservedKey::MigratedFrom).is_none() {
            let start = self.history.first().map_or(self.state, |t| t.from);
            if start != ItemState::Discovered {
                return Err(format!(
                    "item {}: history starts in {start} instead of discovered",
                    self.id
                ));
            }
        }
        for pair in self.history.windows(2) {
            if pair[0].to != pair[1].from {
                return Err(format!(
                    "item {}: history breaks between {} -> {} and {} -> {}",
                    self.id, pair[0].from, pair[0].to, pair[1].from, pair[1].to
                ));
            }
        }
        if let Some(last) = self.history.last()
            && last.to != self.state
        {
            return Err(format!(
                "item {}: state {} does not match last transition to {}",
                self.id, self.state, last.to
            ));
        }
        Ok(())
    }
}
