//! External stage contract.
//!
//! The runner and upload worker only ever see [`Stages`]. Each call either
//! returns its artifact or a [`StageError`] saying whether the failure belongs
//! to one item (`Retryable`) or to the whole run (`Fatal`).

pub mod command;

pub use command::CommandStages;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gavel_common::Metadata;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn reason(&self) -> &str {
        match self {
            StageError::Retryable(reason) | StageError::Fatal(reason) => reason,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Fatal(_))
    }
}

/// One result of discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DiscoveredItem {
    pub fn new(id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            metadata,
        }
    }
}

/// Result of the quality check. A failed check is still a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcOutcome {
    pub passed: bool,
    /// Replacement transcript with QC annotations, when the check wrote one.
    #[serde(default)]
    pub annotated_transcript: Option<PathBuf>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Which sources a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceScope {
    #[default]
    All,
    Named(String),
}

impl SourceScope {
    /// Whether an item with this metadata belongs to the scope. Scoped runs
    /// only touch items whose `source` matches.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            SourceScope::All => true,
            SourceScope::Named(name) => {
                metadata.get("source").and_then(|v| v.as_str()) == Some(name.as_str())
            }
        }
    }
}

impl fmt::Display for SourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceScope::All => f.write_str("all"),
            SourceScope::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for SourceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("source scope must not be empty".to_string());
        }
        if s.eq_ignore_ascii_case("all") {
            Ok(SourceScope::All)
        } else {
            Ok(SourceScope::Named(s.to_ascii_lowercase()))
        }
    }
}

/// The pluggable stage implementations the engine drives.
#[async_trait]
pub trait Stages: Send + Sync {
    async fn discover(&self, scope: &SourceScope) -> Result<Vec<DiscoveredItem>, StageError>;

    async fn download(&self, id: &str, metadata: &Metadata) -> Result<PathBuf, StageError>;

    async fn transcribe(&self, id: &str, artifact: &Path) -> Result<PathBuf, StageError>;

    async fn quality_check(&self, id: &str, transcript: &Path) -> Result<QcOutcome, StageError>;

    async fn format(&self, id: &str, transcript: &Path) -> Result<PathBuf, StageError>;

    /// Called only by the upload worker.
    async fn upload(&self, id: &str, document: &Path, artifact: &Path)
    -> Result<String, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_parsing() {
        assert_eq!("all".parse::<SourceScope>().unwrap(), SourceScope::All);
        assert_eq!("ALL".parse::<SourceScope>().unwrap(), SourceScope::All);
        assert_eq!(
            "House".parse::<SourceScope>().unwrap(),
            SourceScope::Named("house".into())
        );
        assert!("  ".parse::<SourceScope>().is_err());
        assert_eq!(SourceScope::Named("senate".into()).to_string(), "senate");
    }

    #[test]
    fn test_scope_matches_source_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!("house"));

        assert!(SourceScope::All.matches(&metadata));
        assert!(SourceScope::Named("house".into()).matches(&metadata));
        assert!(!SourceScope::Named("senate".into()).matches(&metadata));
        assert!(!SourceScope::Named("house".into()).matches(&Metadata::new()));
    }

    #[test]
    fn test_qc_outcome_defaults() {
        let outcome: QcOutcome = serde_json::from_str(r#"{"passed": false}"#).unwrap();
        assert!(!outcome.passed);
        assert!(outcome.annotated_transcript.is_none());
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_stage_error_reason() {
        let err = StageError::Fatal("missing binary".into());
        assert!(err.is_fatal());
        assert_eq!(err.reason(), "missing binary");
        assert!(!StageError::Retryable("503".into()).is_fatal());
    }
}
