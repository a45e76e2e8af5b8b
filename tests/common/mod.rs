//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Barrier;

use gavel::common::{Metadata, Stage};
use gavel::config::GavelConfig;
use gavel::stages::{DiscoveredItem, QcOutcome, SourceScope, StageError, Stages};

/// Scripted stage implementations.
///
/// Every call succeeds unless a failure was queued for its `(stage, id)`.
/// Calls registered with [`FakeStages::rendezvous`] wait until all of them
/// are in flight at the same time, and fail if that never happens.
#[derive(Default)]
pub struct FakeStages {
    discovered: Mutex<Vec<DiscoveredItem>>,
    failures: Mutex<HashMap<(Stage, String), VecDeque<StageError>>>,
    gates: Mutex<HashMap<(Stage, String), Arc<Barrier>>>,
    calls: Mutex<Vec<(Stage, String)>>,
}

impl FakeStages {
    pub fn new(discovered: Vec<DiscoveredItem>) -> Self {
        Self {
            discovered: Mutex::new(discovered),
            ..Default::default()
        }
    }

    pub fn fail(&self, stage: Stage, id: &str, error: StageError) {
        self.failures
            .lock()
            .unwrap()
            .entry((stage, id.to_string()))
            .or_default()
            .push_back(error);
    }

    pub fn rendezvous(&self, calls: &[(Stage, &str)]) {
        let barrier = Arc::new(Barrier::new(calls.len()));
        let mut gates = self.gates.lock().unwrap();
        for (stage, id) in calls {
            gates.insert((*stage, id.to_string()), Arc::clone(&barrier));
        }
    }

    pub fn calls(&self, stage: Stage) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, id)| id.clone())
            .collect()
    }

    async fn enter(&self, stage: Stage, id: &str) -> Result<(), StageError> {
        self.calls.lock().unwrap().push((stage, id.to_string()));
        let gate = self.gates.lock().unwrap().remove(&(stage, id.to_string()));
        if let Some(barrier) = gate
            && tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                .await
                .is_err()
        {
            return Err(StageError::Retryable(format!(
                "{stage} of {id} never overlapped its partner"
            )));
        }
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(stage, id.to_string()))
            .and_then(VecDeque::pop_front);
        match queued {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Stages for FakeStages {
    async fn discover(&self, _scope: &SourceScope) -> Result<Vec<DiscoveredItem>, StageError> {
        self.enter(Stage::Discover, "*").await?;
        Ok(self.discovered.lock().unwrap().clone())
    }

    async fn download(&self, id: &str, _metadata: &Metadata) -> Result<PathBuf, StageError> {
        self.enter(Stage::Download, id).await?;
        Ok(PathBuf::from(format!("/media/{id}.mp4")))
    }

    async fn transcribe(&self, id: &str, _artifact: &Path) -> Result<PathBuf, StageError> {
        self.enter(Stage::Transcribe, id).await?;
        Ok(PathBuf::from(format!("/transcripts/{id}.txt")))
    }

    async fn quality_check(&self, id: &str, _transcript: &Path) -> Result<QcOutcome, StageError> {
        self.enter(Stage::QualityCheck, id).await?;
        Ok(QcOutcome {
            passed: true,
            annotated_transcript: None,
            issues: Vec::new(),
        })
    }

    async fn format(&self, id: &str, _transcript: &Path) -> Result<PathBuf, StageError> {
        self.enter(Stage::Format, id).await?;
        Ok(PathBuf::from(format!("/docs/{id}.docx")))
    }

    async fn upload(
        &self,
        id: &str,
        _document: &Path,
        _artifact: &Path,
    ) -> Result<String, StageError> {
        self.enter(Stage::Upload, id).await?;
        Ok(format!("s3://hearings/{id}"))
    }
}

pub fn hearing(id: &str, source: &str) -> DiscoveredItem {
    let mut metadata = Metadata::new();
    metadata.insert("source".into(), json!(source));
    metadata.insert("title".into(), json!(format!("Hearing {id}")));
    DiscoveredItem::new(id, metadata)
}

/// Configuration rooted in `dir` with short timeouts.
pub fn test_config(dir: &Path) -> GavelConfig {
    let mut config = GavelConfig::default();
    config.store.path = dir.join("state").join("pipeline.json");
    config.lock.path = dir.join("state").join("gavel.lock");
    config.policy.max_retries = 3;
    config.policy.upload_drain_timeout_secs = 10;
    config
}
