//! Subprocess-backed stages.
//!
//! Each stage is one configured command. The request goes to the child as a
//! JSON document on stdin and the result comes back as JSON on stdout:
//!
//! | stage           | response                                           |
//! |-----------------|----------------------------------------------------|
//! | `discover`      | `{"items": [{"id": ..., "metadata": {...}}]}`      |
//! | `download`      | `{"artifact_path": ...}`                           |
//! | `transcribe`    | `{"transcript_path": ...}`                         |
//! | `quality_check` | `{"passed": bool, "annotated_transcript": ..., "issues": [...]}` |
//! | `format`        | `{"document_path": ...}`                           |
//! | `upload`        | `{"upload_location": ...}`                         |
//!
//! Exit 0 is success. Exit codes listed in `fatal_exit_codes` and commands
//! that cannot be started abort the run; everything else, including a
//! timeout, fails only the item.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use gavel_common::{Metadata, Stage};

use super::{DiscoveredItem, QcOutcome, SourceScope, StageError, Stages};
use crate::config::{GavelConfig, StagesSection};

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcript_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl<'a> StageRequest<'a> {
    fn new(stage: Stage, id: Option<&'a str>) -> Self {
        Self {
            stage,
            id,
            metadata: None,
            artifact_path: None,
            transcript_path: None,
            document_path: None,
            scope: None,
        }
    }
}

#[derive(serde::Deserialize)]
struct DiscoverResponse {
    items: Vec<DiscoveredItem>,
}

#[derive(serde::Deserialize)]
struct DownloadResponse {
    artifact_path: PathBuf,
}

#[derive(serde::Deserialize)]
struct TranscribeResponse {
    transcript_path: PathBuf,
}

#[derive(serde::Deserialize)]
struct FormatResponse {
    document_path: PathBuf,
}

#[derive(serde::Deserialize)]
struct UploadResponse {
    upload_location: String,
}

/// Runs each stage as an external command.
#[derive(Debug, Clone)]
pub struct CommandStages {
    section: StagesSection,
    timeout: Duration,
}

impl CommandStages {
    pub fn new(section: StagesSection, timeout: Duration) -> Self {
        Self { section, timeout }
    }

    pub fn from_config(config: &GavelConfig) -> Self {
        Self::new(config.stages.clone(), config.stage_timeout())
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        request: &StageRequest<'_>,
    ) -> Result<T, StageError> {
        let stage = request.stage;
        let (program, args) = self
            .section
            .command(stage)
            .split_first()
            .ok_or_else(|| StageError::Fatal(format!("no command configured for {stage}")))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| StageError::Fatal(format!("failed to encode {stage} request: {e}")))?;

        debug!(stage = %stage, id = request.id.unwrap_or("-"), program = %program, "Invoking stage command");

        let mut child = Command::new(program)
            .args(args)
            .env("GAVEL_STAGE", stage.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    StageError::Fatal(format!("cannot run {program}: {e}"))
                }
                _ => StageError::Retryable(format!("failed to spawn {program}: {e}")),
            })?;

        // Writing the request and waiting share one deadline. Dropping the
        // future drops the child, and kill_on_drop kills it.
        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(&payload).await {
                    // The command is free to ignore its input.
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                        return Err(StageError::Retryable(format!(
                            "failed to write {stage} request: {e}"
                        )));
                    }
                    _ => {}
                }
            }
            child.wait_with_output().await.map_err(|e| {
                StageError::Retryable(format!("failed to wait for {program}: {e}"))
            })
        };
        let output = match timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StageError::Retryable(format!(
                    "{stage} timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or("").to_string();
            let reason = match output.status.code() {
                Some(code) if detail.is_empty() => format!("{program} exited with code {code}"),
                Some(code) => format!("{program} exited with code {code}: {detail}"),
                None => format!("{program} was terminated by a signal"),
            };
            return match output.status.code() {
                Some(code) if self.section.fatal_exit_codes.contains(&code) => {
                    Err(StageError::Fatal(reason))
                }
                _ => Err(StageError::Retryable(reason)),
            };
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            StageError::Retryable(format!("unparsable {stage} response from {program}: {e}"))
        })
    }
}

#[async_trait]
impl Stages for CommandStages {
    async fn discover(&self, scope: &SourceScope) -> Result<Vec<DiscoveredItem>, StageError> {
        let mut request = StageRequest::new(Stage::Discover, None);
        request.scope = Some(scope.to_string());
        let response: DiscoverResponse = self.invoke(&request).await?;
        Ok(response.items)
    }

    async fn download(&self, id: &str, metadata: &Metadata) -> Result<PathBuf, StageError> {
        let mut request = StageRequest::new(Stage::Download, Some(id));
        request.metadata = Some(metadata);
        let response: DownloadResponse = self.invoke(&request).await?;
        Ok(response.artifact_path)
    }

    async fn transcribe(&self, id: &str, artifact: &Path) -> Result<PathBuf, StageError> {
        let mut request = StageRequest::new(Stage::Transcribe, Some(id));
        request.artifact_path = Some(artifact);
        let response: TranscribeResponse = self.invoke(&request).await?;
        Ok(response.transcript_path)
    }

    async fn quality_check(&self, id: &str, transcript: &Path) -> Result<QcOutcome, StageError> {
        let mut request = StageRequest::new(Stage::QualityCheck, Some(id));
        request.transcript_path = Some(transcript);
        self.invoke(&request).await
    }

    async fn format(&self, id: &str, transcript: &Path) -> Result<PathBuf, StageError> {
        let mut request = StageRequest::new(Stage::Format, Some(id));
        request.transcript_path = Some(transcript);
        let response: FormatResponse = self.invoke(&request).await?;
        Ok(response.document_path)
    }

    async fn upload(
        &self,
        id: &str,
        document: &Path,
        artifact: &Path,
    ) -> Result<String, StageError> {
        let mut request = StageRequest::new(Stage::Upload, Some(id));
        request.document_path = Some(document);
        request.artifact_path = Some(artifact);
        let response: UploadResponse = self.invoke(&request).await?;
        Ok(response.upload_location)
    }
}
