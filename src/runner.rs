//! Stage runner.
//!
//! Drives items through download, transcribe, quality check and format one
//! at a time, committing every outcome through the ledger. A retryable stage
//! failure fails only its item; a fatal one stops the run and leaves the item
//! where it was so the next run re-enters it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use gavel_common::{ItemRecord, ItemState, ReservedKey, Stage, StatePatch};

use crate::config::GavelConfig;
use crate::errors::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::stages::{SourceScope, StageError, Stages};
use crate::upload::UploadWorker;

/// Skip reason for discovered items dated on or before `after_date`.
pub const SKIP_BEFORE_CUTOFF: &str = "before_cutoff";
/// Skip reason for formatted items whose quality check failed.
pub const SKIP_QC_FAILED: &str = "qc_failed";

/// Stage order within a sweep: nearest to completion first.
const SWEEP_ORDER: [Stage; 4] = [
    Stage::Format,
    Stage::QualityCheck,
    Stage::Transcribe,
    Stage::Download,
];

#[derive(Debug, Clone)]
pub struct RunPolicy {
    pub scope: SourceScope,
    /// Stop pulling new work once this instant passes.
    pub deadline: Option<Instant>,
    pub require_qc_pass: bool,
    pub after_date: Option<NaiveDate>,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            scope: SourceScope::All,
            deadline: None,
            require_qc_pass: true,
            after_date: None,
        }
    }
}

impl RunPolicy {
    pub fn from_config(config: &GavelConfig, scope: SourceScope, started: Instant) -> Self {
        Self {
            scope,
            deadline: Some(started + config.run_timeout()),
            require_qc_pass: config.policy.require_qc_pass,
            after_date: config.policy.after_date,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub discovered: usize,
    pub new_items: usize,
    pub skipped: usize,
    pub retried: usize,
    pub advanced: BTreeMap<Stage, usize>,
    pub failed: usize,
    pub enqueued: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub abandoned_uploads: usize,
    pub deadline_hit: bool,
}

impl RunSummary {
    pub fn advanced(&self, stage: Stage) -> usize {
        self.advanced.get(&stage).copied().unwrap_or(0)
    }
}

pub struct StageRunner {
    ledger: Arc<Ledger>,
    stages: Arc<dyn Stages>,
    policy: RunPolicy,
    summary: RunSummary,
}

impl StageRunner {
    pub fn new(ledger: Arc<Ledger>, stages: Arc<dyn Stages>, policy: RunPolicy) -> Self {
        Self {
            ledger,
            stages,
            policy,
            summary: RunSummary::default(),
        }
    }

    pub fn into_summary(self) -> RunSummary {
        self.summary
    }

    fn deadline_passed(&mut self) -> bool {
        let passed = self.policy.deadline.is_some_and(|d| Instant::now() >= d);
        if passed && !self.summary.deadline_hit {
            warn!("Run deadline reached, no new work will be started");
            self.summary.deadline_hit = true;
        }
        passed
    }

    /// In-scope items in `states`, oldest discovery first.
    fn candidates(&self, states: &[ItemState]) -> Vec<ItemRecord> {
        let mut records: Vec<ItemRecord> = states
            .iter()
            .flat_map(|state| self.ledger.list_by_state(*state))
            .filter(|r| self.policy.scope.matches(&r.metadata))
            .collect();
        records.sort_by(|a, b| {
            a.discovered_at()
                .cmp(&b.discovered_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// Run discovery and register the results. Any discovery error is fatal.
    pub async fn discover(&mut self) -> Result<usize> {
        let items = self
            .stages
            .discover(&self.policy.scope)
            .await
            .map_err(|e| PipelineError::DiscoveryFailure(e.reason().to_string()))?;
        self.summary.discovered = items.len();

        let created = self
            .ledger
            .register_discovered(items.into_iter().map(|item| (item.id, item.metadata)))?;
        self.summary.new_items = created;
        info!(discovered = self.summary.discovered, new = created, scope = %self.policy.scope, "Discovery complete");
        Ok(created)
    }

    /// Skip discovered items dated on or before the configured cutoff. Items
    /// without a parseable `date` are kept.
    pub fn apply_cutoff(&mut self) -> Result<usize> {
        let Some(cutoff) = self.policy.after_date else {
            return Ok(0);
        };
        let mut skipped = 0;
        for record in self.candidates(&[ItemState::Discovered]) {
            let date = record
                .describe_str("date")
                .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
            if date.is_some_and(|d| d <= cutoff) {
                self.ledger.set_state(
                    &record.id,
                    ItemState::Skipped,
                    StatePatch::skip(SKIP_BEFORE_CUTOFF),
                )?;
                skipped += 1;
            }
        }
        if skipped > 0 {
            info!(skipped, %cutoff, "Skipped items dated before the cutoff");
        }
        self.summary.skipped += skipped;
        Ok(skipped)
    }

    /// Move failed items that are still under the retry cap back to the state
    /// their failed attempt started from.
    pub fn retry_failed(&mut self) -> Result<usize> {
        let mut retried = 0;
        for record in self.candidates(&[ItemState::Failed]) {
            match self.ledger.retry_target(&record) {
                Some(target) => {
                    self.ledger.set_state(&record.id, target, StatePatch::new())?;
                    debug!(id = %record.id, to = %target, attempt = record.retry_count + 1, "Retrying");
                    retried += 1;
                }
                None => debug!(id = %record.id, retry_count = record.retry_count, "Permanently failed"),
            }
        }
        if retried > 0 {
            info!(retried, "Re-queued failed items");
        }
        self.summary.retried += retried;
        Ok(retried)
    }

    /// Hand items left in `uploading` by an earlier run back to the worker.
    pub fn resume_uploads(&mut self, worker: &UploadWorker) -> Result<usize> {
        let pending = self.candidates(&[ItemState::Uploading]);
        for record in &pending {
            worker.enqueue(&record.id)?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Resumed interrupted uploads");
        }
        self.summary.enqueued += pending.len();
        Ok(pending.len())
    }

    /// Sweep until nothing moves, the deadline passes or the upload worker
    /// stops.
    pub async fn run(&mut self, worker: &UploadWorker) -> Result<()> {
        loop {
            let progress = self.sweep(worker).await?;
            if progress == 0 || self.summary.deadline_hit || worker.has_stopped() {
                return Ok(());
            }
        }
    }

    /// One pass over every stage. Returns how many items moved.
    pub async fn sweep(&mut self, worker: &UploadWorker) -> Result<usize> {
        let mut progress = self.hand_off_formatted(worker)?;
        for stage in SWEEP_ORDER {
            if self.deadline_passed() || worker.has_stopped() {
                break;
            }
            progress += self.run_stage(stage, worker).await?;
        }
        Ok(progress)
    }

    async fn run_stage(&mut self, stage: Stage, worker: &UploadWorker) -> Result<usize> {
        let mut states = Vec::with_capacity(2);
        if let Some(active) = stage.active_state() {
            states.push(active);
        }
        if let Some(input) = stage.input_state() {
            states.push(input);
        }

        let mut moved = 0;
        for record in self.candidates(&states) {
            if self.deadline_passed() || worker.has_stopped() {
                break;
            }
            self.process(stage, record, worker).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Take one item through one stage.
    async fn process(
        &mut self,
        stage: Stage,
        mut record: ItemRecord,
        worker: &UploadWorker,
    ) -> Result<()> {
        let id = record.id.clone();
        if let Some(active) = stage.active_state()
            && record.state != active
        {
            record = self.ledger.set_state(&id, active, StatePatch::new())?;
        }

        let result = self.call_stage(stage, &record).await;
        let patch = match result {
            Ok(patch) => patch,
            Err(StageError::Fatal(reason)) => {
                return Err(PipelineError::StageFatal { stage, id, reason });
            }
            Err(StageError::Retryable(reason)) => {
                let patch = StatePatch::failure(stage, reason.as_str());
                let failed = self.ledger.set_state(&id, ItemState::Failed, patch)?;
                warn!(id = %id, stage = %stage, reason = %reason, retry_count = failed.retry_count, "Stage failed");
                self.summary.failed += 1;
                return Ok(());
            }
        };

        let next = stage
            .output_state()
            .ok_or_else(|| PipelineError::UnexpectedState {
                id: id.clone(),
                state: record.state,
                stage,
            })?;
        let record = self.ledger.set_state(&id, next, patch)?;
        *self.summary.advanced.entry(stage).or_insert(0) += 1;
        info!(id = %id, stage = %stage, state = %next, "Stage complete");

        if next == ItemState::Formatted {
            self.hand_off(&record, worker)?;
        }
        Ok(())
    }

    /// Invoke the external stage function and build the metadata patch for
    /// its successor state. A missing input artifact fails the item.
    async fn call_stage(
        &self,
        stage: Stage,
        record: &ItemRecord,
    ) -> std::result::Result<StatePatch, StageError> {
        let id = record.id.as_str();
        let path_of = |key: ReservedKey| {
            record
                .reserved_str(key)
                .map(PathBuf::from)
                .ok_or_else(|| StageError::Retryable(format!("missing {}", key.as_str())))
        };

        match stage {
            Stage::Download => {
                let artifact = self.stages.download(id, &record.metadata).await?;
                Ok(StatePatch::new().with(ReservedKey::ArtifactPath, path_value(&artifact)))
            }
            Stage::Transcribe => {
                let artifact = path_of(ReservedKey::ArtifactPath)?;
                let transcript = self.stages.transcribe(id, &artifact).await?;
                Ok(StatePatch::new().with(ReservedKey::TranscriptPath, path_value(&transcript)))
            }
            Stage::QualityCheck => {
                let transcript = path_of(ReservedKey::TranscriptPath)?;
                let outcome = self.stages.quality_check(id, &transcript).await?;
                if !outcome.passed {
                    warn!(id, issues = ?outcome.issues, "Quality check failed");
                }
                let mut patch = StatePatch::qc(outcome.passed, outcome.issues);
                if let Some(annotated) = outcome.annotated_transcript {
                    patch = patch.with(ReservedKey::TranscriptPath, path_value(&annotated));
                }
                Ok(patch)
            }
            Stage::Format => {
                let transcript = path_of(ReservedKey::TranscriptPath)?;
                let document = self.stages.format(id, &transcript).await?;
                Ok(StatePatch::new().with(ReservedKey::DocumentPath, path_value(&document)))
            }
            Stage::Discover | Stage::Upload => Err(StageError::Fatal(format!(
                "{stage} is not driven by the stage runner"
            ))),
        }
    }

    fn hand_off_formatted(&mut self, worker: &UploadWorker) -> Result<usize> {
        let ready = self.candidates(&[ItemState::Formatted]);
        for record in &ready {
            self.hand_off(record, worker)?;
        }
        Ok(ready.len())
    }

    /// Formatted items go to the upload queue, or to `skipped` when their
    /// quality check failed and a pass is required.
    fn hand_off(&mut self, record: &ItemRecord, worker: &UploadWorker) -> Result<()> {
        let qc_passed = record
            .reserved(ReservedKey::QcPassed)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !qc_passed && self.policy.require_qc_pass {
            self.ledger.set_state(
                &record.id,
                ItemState::Skipped,
                StatePatch::skip(SKIP_QC_FAILED),
            )?;
            info!(id = %record.id, "Skipped upload after failed quality check");
            self.summary.skipped += 1;
            return Ok(());
        }

        self.ledger
            .set_state(&record.id, ItemState::Uploading, StatePatch::new())?;
        worker.enqueue(&record.id)?;
        self.summary.enqueued += 1;
        Ok(())
    }
}

fn path_value(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{DiscoveredItem, QcOutcome};
    use crate::store::DurableStore;
    use async_trait::async_trait;
    use gavel_common::{Metadata, StateMachine};
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Scripted stages: each (stage, id) pops its next outcome from a queue;
    /// an empty queue means success.
    #[derive(Default)]
    struct FakeStages {
        discovered: Vec<DiscoveredItem>,
        script: Mutex<HashMap<(Stage, String), Vec<StageError>>>,
        qc_fails: Vec<String>,
        calls: Mutex<Vec<(Stage, String)>>,
    }

    impl FakeStages {
        fn fail_next(self, stage: Stage, id: &str, errors: Vec<StageError>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert((stage, id.to_string()), errors);
            self
        }

        fn outcome(&self, stage: Stage, id: &str) -> std::result::Result<(), StageError> {
            self.calls.lock().unwrap().push((stage, id.to_string()));
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&(stage, id.to_string())) {
                Some(queue) if !queue.is_empty() => Err(queue.remove(0)),
                _ => Ok(()),
            }
        }

        fn calls_for(&self, stage: Stage) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == stage)
                .map(|(_, id)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Stages for FakeStages {
        async fn discover(
            &self,
            _: &SourceScope,
        ) -> std::result::Result<Vec<DiscoveredItem>, StageError> {
            self.outcome(Stage::Discover, "*")?;
            Ok(self.discovered.clone())
        }
        async fn download(
            &self,
            id: &str,
            _: &Metadata,
        ) -> std::result::Result<PathBuf, StageError> {
            self.outcome(Stage::Download, id)?;
            Ok(PathBuf::from(format!("/media/{id}.mp4")))
        }
        async fn transcribe(
            &self,
            id: &str,
            _: &Path,
        ) -> std::result::Result<PathBuf, StageError> {
            self.outcome(Stage::Transcribe, id)?;
            Ok(PathBuf::from(format!("/transcripts/{id}.txt")))
        }
        async fn quality_check(
            &self,
            id: &str,
            transcript: &Path,
        ) -> std::result::Result<QcOutcome, StageError> {
            self.outcome(Stage::QualityCheck, id)?;
            let passed = !self.qc_fails.iter().any(|f| f == id);
            Ok(QcOutcome {
                passed,
                annotated_transcript: Some(transcript.with_extension("qc.txt")),
                issues: if passed { vec![] } else { vec!["garbled".into()] },
            })
        }
        async fn format(&self, id: &str, _: &Path) -> std::result::Result<PathBuf, StageError> {
            self.outcome(Stage::Format, id)?;
            Ok(PathBuf::from(format!("/docs/{id}.docx")))
        }
        async fn upload(
            &self,
            id: &str,
            _: &Path,
            _: &Path,
        ) -> std::result::Result<String, StageError> {
            self.outcome(Stage::Upload, id)?;
            Ok(format!("s3://bucket/{id}"))
        }
    }

    fn item(id: &str, source: &str, date: &str) -> DiscoveredItem {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!(source));
        metadata.insert("date".into(), json!(date));
        DiscoveredItem::new(id, metadata)
    }

    fn make_ledger(max_retries: u32) -> (Arc<Ledger>, TempDir) {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(
            DurableStore::new(dir.path().join("pipeline.json")),
            StateMachine::new(max_retries),
        )
        .unwrap();
        (Arc::new(ledger), dir)
    }

    async fn run_once(
        ledger: &Arc<Ledger>,
        stages: &Arc<FakeStages>,
        policy: RunPolicy,
    ) -> Result<RunSummary> {
        let stages: Arc<dyn Stages> = stages.clone();
        let worker = UploadWorker::spawn(Arc::clone(ledger), Arc::clone(&stages));
        let mut runner = StageRunner::new(Arc::clone(ledger), stages, policy);
        runner.discover().await?;
        runner.apply_cutoff()?;
        runner.retry_failed()?;
        runner.resume_uploads(&worker)?;
        let outcome = runner.run(&worker).await;
        let report = worker.finish(Duration::from_secs(5)).await;
        outcome?;
        let mut summary = runner.into_summary();
        summary.uploaded = report.uploaded;
        summary.upload_failed = report.failed;
        Ok(summary)
    }

    #[tokio::test]
    async fn test_items_flow_to_uploaded() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("a", "house", "2025-03-01"), item("b", "senate", "2025-03-02")],
            ..Default::default()
        });

        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(summary.new_items, 2);
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.advanced(Stage::Download), 2);
        assert_eq!(summary.advanced(Stage::Format), 2);

        let a = ledger.get("a").unwrap();
        assert_eq!(a.state, ItemState::Uploaded);
        assert_eq!(a.reserved_str(ReservedKey::ArtifactPath), Some("/media/a.mp4"));
        assert_eq!(
            a.reserved_str(ReservedKey::TranscriptPath),
            Some("/transcripts/a.qc.txt")
        );
        assert_eq!(a.reserved_str(ReservedKey::DocumentPath), Some("/docs/a.docx"));
        assert_eq!(a.reserved_str(ReservedKey::UploadLocation), Some("s3://bucket/a"));
        assert_eq!(a.history.len(), 8);
        a.check_history().unwrap();
    }

    #[tokio::test]
    async fn test_second_run_does_not_reprocess() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("a", "house", "2025-03-01")],
            ..Default::default()
        });
        run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();

        assert_eq!(summary.new_items, 0);
        assert_eq!(summary.advanced(Stage::Download), 0);
        assert_eq!(stages.calls_for(Stage::Download), vec!["a"]);
        assert_eq!(stages.calls_for(Stage::Upload), vec!["a"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_isolated_to_one_item() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(
            FakeStages {
                discovered: vec![item("a", "house", "2025-03-01"), item("b", "house", "2025-03-02")],
                ..Default::default()
            }
            .fail_next(
                Stage::Transcribe,
                "a",
                vec![StageError::Retryable("model crashed".into())],
            ),
        );

        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(summary.failed, 1);

        let a = ledger.get("a").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.retry_count, 1);
        assert_eq!(a.reserved_str(ReservedKey::FailureStage), Some("transcribe"));
        assert_eq!(a.reserved_str(ReservedKey::FailureReason), Some("model crashed"));
        assert_eq!(ledger.get("b").unwrap().state, ItemState::Uploaded);

        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(ledger.get("a").unwrap().state, ItemState::Uploaded);
    }

    #[tokio::test]
    async fn test_retry_cap_makes_failure_permanent() {
        let (ledger, _dir) = make_ledger(2);
        let stages = Arc::new(
            FakeStages {
                discovered: vec![item("a", "house", "2025-03-01")],
                ..Default::default()
            }
            .fail_next(
                Stage::Download,
                "a",
                vec![
                    StageError::Retryable("404".into()),
                    StageError::Retryable("404".into()),
                ],
            ),
        );

        for _ in 0..3 {
            run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        }
        let a = ledger.get("a").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.retry_count, 2);
        assert!(ledger.machine().is_permanently_failed(&a));
        assert_eq!(stages.calls_for(Stage::Download).len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts_but_keeps_committed_work() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(
            FakeStages {
                discovered: vec![item("a", "house", "2025-03-01"), item("b", "house", "2025-03-02")],
                ..Default::default()
            }
            .fail_next(
                Stage::Download,
                "b",
                vec![StageError::Fatal("yt-dlp not installed".into())],
            ),
        );

        let err = run_once(&ledger, &stages, RunPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageFatal { stage: Stage::Download, .. }));

        assert_eq!(ledger.get("a").unwrap().state, ItemState::Downloaded);
        let b = ledger.get("b").unwrap();
        assert_eq!(b.state, ItemState::Downloading);
        assert_eq!(b.retry_count, 0);
        assert!(stages.calls_for(Stage::Transcribe).is_empty());

        // The next run re-enters the interrupted download.
        run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(ledger.get("b").unwrap().state, ItemState::Uploaded);
    }

    #[tokio::test]
    async fn test_failed_upload_is_retried_through_the_worker() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(
            FakeStages {
                discovered: vec![item("a", "house", "2025-03-01")],
                ..Default::default()
            }
            .fail_next(
                Stage::Upload,
                "a",
                vec![StageError::Retryable("503 slow down".into())],
            ),
        );

        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(summary.upload_failed, 1);
        assert_eq!(ledger.get("a").unwrap().state, ItemState::Failed);

        let summary = run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.uploaded, 1);
        let a = ledger.get("a").unwrap();
        assert_eq!(a.state, ItemState::Uploaded);
        assert_eq!(stages.calls_for(Stage::Format), vec!["a"]);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages::default().fail_next(
            Stage::Discover,
            "*",
            vec![StageError::Retryable("site down".into())],
        ));
        let err = run_once(&ledger, &stages, RunPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DiscoveryFailure(_)));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_cutoff_skips_old_items_and_keeps_unknown_dates() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![
                item("old", "house", "2025-01-01"),
                item("edge", "house", "2025-02-01"),
                item("new", "house", "2025-02-02"),
                item("undated", "house", "Unknown"),
            ],
            ..Default::default()
        });
        let policy = RunPolicy {
            after_date: NaiveDate::from_ymd_opt(2025, 2, 1),
            ..RunPolicy::default()
        };

        let summary = run_once(&ledger, &stages, policy).await.unwrap();
        assert_eq!(summary.skipped, 2);
        for id in ["old", "edge"] {
            let record = ledger.get(id).unwrap();
            assert_eq!(record.state, ItemState::Skipped);
            assert_eq!(record.reserved_str(ReservedKey::SkipReason), Some(SKIP_BEFORE_CUTOFF));
        }
        assert_eq!(ledger.get("new").unwrap().state, ItemState::Uploaded);
        assert_eq!(ledger.get("undated").unwrap().state, ItemState::Uploaded);
    }

    #[tokio::test]
    async fn test_failed_qc_is_skipped_when_required() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("bad", "house", "2025-03-01"), item("good", "house", "2025-03-02")],
            qc_fails: vec!["bad".into()],
            ..Default::default()
        });

        run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        let bad = ledger.get("bad").unwrap();
        assert_eq!(bad.state, ItemState::Skipped);
        assert_eq!(bad.reserved_str(ReservedKey::SkipReason), Some(SKIP_QC_FAILED));
        assert_eq!(bad.reserved(ReservedKey::QcPassed), Some(&json!(false)));
        assert_eq!(ledger.get("good").unwrap().state, ItemState::Uploaded);
    }

    #[tokio::test]
    async fn test_failed_qc_still_uploads_when_not_required() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("bad", "house", "2025-03-01")],
            qc_fails: vec!["bad".into()],
            ..Default::default()
        });
        let policy = RunPolicy {
            require_qc_pass: false,
            ..RunPolicy::default()
        };

        run_once(&ledger, &stages, policy).await.unwrap();
        assert_eq!(ledger.get("bad").unwrap().state, ItemState::Uploaded);
    }

    #[tokio::test]
    async fn test_scope_limits_processing() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("h", "house", "2025-03-01"), item("s", "senate", "2025-03-01")],
            ..Default::default()
        });
        let policy = RunPolicy {
            scope: SourceScope::Named("senate".into()),
            ..RunPolicy::default()
        };

        run_once(&ledger, &stages, policy).await.unwrap();
        assert_eq!(ledger.get("s").unwrap().state, ItemState::Uploaded);
        assert_eq!(ledger.get("h").unwrap().state, ItemState::Discovered);
    }

    #[tokio::test]
    async fn test_expired_deadline_starts_no_work() {
        let (ledger, _dir) = make_ledger(3);
        let stages = Arc::new(FakeStages {
            discovered: vec![item("a", "house", "2025-03-01")],
            ..Default::default()
        });
        let policy = RunPolicy {
            deadline: Some(Instant::now()),
            ..RunPolicy::default()
        };

        let summary = run_once(&ledger, &stages, policy).await.unwrap();
        assert!(summary.deadline_hit);
        assert_eq!(ledger.get("a").unwrap().state, ItemState::Discovered);
        assert!(stages.calls_for(Stage::Download).is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_item() {
        let (ledger, _dir) = make_ledger(3);
        ledger
            .register_discovered(vec![("a".to_string(), Metadata::new())])
            .unwrap();
        ledger
            .set_state("a", ItemState::Downloading, StatePatch::new())
            .unwrap();
        ledger
            .set_state("a", ItemState::Downloaded, StatePatch::new())
            .unwrap();
        let stages = Arc::new(FakeStages::default());

        run_once(&ledger, &stages, RunPolicy::default()).await.unwrap();
        let a = ledger.get("a").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(
            a.reserved_str(ReservedKey::FailureReason),
            Some("missing artifact_path")
        );
        assert!(stages.calls_for(Stage::Transcribe).is_empty());
    }
}
