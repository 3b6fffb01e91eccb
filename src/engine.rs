//! Enrichment/migration engine.
//!
//! The engine walks the two-level hierarchy one record at a time and
//! applies a [`RecordOperation`] to each. Every run moves through
//!
//! ```text
//! Idle ─▶ Scanning ─▶ Processing ─▶ Flushing ─▶ Completed | Failed | Cancelled
//! ```
//!
//! Records are processed strictly in sequence: one shared rate limiter
//! paces outbound calls, backoff delays stay meaningful, and batch commit
//! order is deterministic. Per-record problems are collected into the
//! [`MigrationResult`] and never raised mid-run. Only two things make
//! [`Engine::run`] return `Err`: a setup failure while scanning (nothing
//! has been processed yet) and an invalid buffer configuration. A batch
//! commit failure ends the run early with a `Failed` result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use course_harness_core::models::{Collection, FieldMap, Record, RecordRef, TargetLevel};
use course_harness_core::progress::ProgressState;
use course_harness_core::rate_limit::RateLimiter;
use course_harness_core::store::Store;
use course_harness_core::validate::ShapeIssue;

use crate::batch::MutationBuffer;
use crate::config::Config;
use crate::error::{PipelineError, TransientKind};
use crate::progress::ProgressReporter;
use crate::retry::RetryController;

/// One kind of per-record work the engine can run.
#[async_trait]
pub trait RecordOperation: Send + Sync {
    /// Operation name, used in logs and results.
    fn name(&self) -> &str;

    /// Which level of the hierarchy the operation walks.
    fn target(&self) -> TargetLevel;

    /// Idempotency check: true when the record already carries this
    /// operation's marker and must be skipped.
    fn is_applied(&self, record: &Record) -> bool;

    /// Structural precondition. Failing records are never retried.
    fn validate(&self, record: &Record) -> Result<(), ShapeIssue>;

    /// Whether [`apply`](RecordOperation::apply) calls the external
    /// enrichment service and so needs pacing, timeout and retry.
    fn uses_external_service(&self) -> bool {
        false
    }

    /// Derive the fields to write. `parent` is the owning collection for
    /// child records.
    async fn apply(
        &self,
        record: &Record,
        parent: Option<&Collection>,
    ) -> Result<FieldMap, PipelineError>;

    /// Marker fields staged alongside the derived ones.
    fn marker_fields(&self, record: &Record) -> FieldMap;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Scanning,
    Processing,
    Flushing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Phase a run ends in when it finishes with this status.
    pub fn terminal_phase(self) -> RunPhase {
        match self {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Failed => RunPhase::Failed,
            RunStatus::Cancelled => RunPhase::Cancelled,
        }
    }
}

/// A per-record failure collected during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub reference: RecordRef,
    pub code: String,
    pub message: String,
}

/// Terminal summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub operation: String,
    pub status: RunStatus,
    pub total: u64,
    pub processed: u64,
    /// Records whose mutations were durably committed.
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<RunError>,
    /// Mutations dropped by a failed batch commit.
    pub lost: Vec<RecordRef>,
    pub batches_committed: u64,
    pub backup_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl MigrationResult {
    /// A result for a run that never reached the engine (e.g. a required
    /// backup failed).
    pub fn aborted(operation: &str, error: &PipelineError) -> Self {
        Self {
            operation: operation.to_string(),
            status: RunStatus::Failed,
            total: 0,
            processed: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            errors: vec![RunError {
                reference: RecordRef::collection("*"),
                code: error.code().to_string(),
                message: error.to_string(),
            }],
            lost: Vec::new(),
            batches_committed: 0,
            backup_id: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn failure_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }
}

/// Knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_capacity: usize,
    pub safety_margin: usize,
    /// Largest failed/processed ratio that still counts as `Completed` (inclusive).
    pub failure_tolerance: f64,
    pub progress_every: u64,
    pub call_timeout: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub poll_interval: Duration,
    /// Limiter key for outbound enrichment calls.
    pub limiter_key: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_capacity: config.batch.capacity,
            safety_margin: config.batch.safety_margin,
            failure_tolerance: config.pipeline.failure_tolerance,
            progress_every: config.pipeline.progress_every,
            call_timeout: config.enrichment.call_timeout(),
            rate_limit: config.rate_limit.calls_per_window,
            rate_window: Duration::from_millis(config.rate_limit.window_ms),
            poll_interval: Duration::from_millis(config.rate_limit.poll_interval_ms),
            limiter_key: format!("enrichment:{}", config.enrichment.provider),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::minimal())
    }
}

struct WorkItem {
    reference: RecordRef,
    parent: Option<usize>,
}

enum Outcome {
    Skipped,
    Failed(PipelineError),
    Staged(FieldMap),
}

pub struct Engine {
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    retry: RetryController,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        retry: RetryController,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            retry,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, limiter: Arc<RateLimiter>, config: &Config) -> Self {
        Self::new(
            store,
            limiter,
            RetryController::new(config.retry_config()),
            EngineSettings::from_config(config),
        )
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `op` over every target record, optionally limited to one collection.
    pub async fn run(
        &self,
        op: &dyn RecordOperation,
        scope: Option<&str>,
        reporter: &dyn ProgressReporter,
    ) -> Result<MigrationResult, PipelineError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut phase = RunPhase::Idle;

        transition(&mut phase, RunPhase::Scanning, op.name());
        let (collections, items) = self.scan(op.target(), scope).await?;
        let mut buffer = MutationBuffer::new(
            self.store.clone(),
            self.settings.batch_capacity,
            self.settings.safety_margin,
        )?;

        let total = items.len() as u64;
        let mut progress = ProgressState::new(total);
        progress.current_label = format!("{} scanning", op.name());
        reporter.report(&progress);

        let mut errors: Vec<RunError> = Vec::new();
        let mut lost: Vec<RecordRef> = Vec::new();
        let mut aborted = false;
        let mut cancelled = false;

        transition(&mut phase, RunPhase::Processing, op.name());
        for item in &items {
            if self.cancel.is_cancelled() {
                tracing::warn!(
                    operation = op.name(),
                    processed = progress.processed_count,
                    "run cancelled"
                );
                cancelled = true;
                break;
            }

            let parent = item.parent.map(|i| &collections[i]);
            progress.current_label = format!("{} {}", op.name(), item.reference);

            match self.process_one(op, &item.reference, parent).await {
                Outcome::Skipped => progress.skipped_count += 1,
                Outcome::Failed(e) => {
                    tracing::warn!(record = %item.reference, error = %e, "record failed");
                    progress.failure_count += 1;
                    errors.push(run_error(&item.reference, &e));
                }
                Outcome::Staged(fields) => {
                    progress.success_count += 1;
                    if let Err(e) = buffer.stage(item.reference.clone(), fields).await {
                        progress.processed_count += 1;
                        absorb_commit_failure(e, &mut progress, &mut errors, &mut lost);
                        aborted = true;
                        break;
                    }
                }
            }

            progress.processed_count += 1;
            if progress.processed_count % self.settings.progress_every.max(1) == 0 {
                reporter.report(&progress);
            }
        }

        if !aborted {
            transition(&mut phase, RunPhase::Flushing, op.name());
            if let Err(e) = buffer.flush_remaining().await {
                absorb_commit_failure(e, &mut progress, &mut errors, &mut lost);
                aborted = true;
            }
        }

        let status = if aborted {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else if within_tolerance(
            progress.failure_count,
            progress.processed_count,
            self.settings.failure_tolerance,
        ) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        if !aborted {
            progress.current_label = format!("{} done", op.name());
            reporter.report(&progress);
        }

        transition(&mut phase, status.terminal_phase(), op.name());

        let result = MigrationResult {
            operation: op.name().to_string(),
            status,
            total,
            processed: progress.processed_count,
            success: buffer.mutations_committed(),
            failed: progress.failure_count,
            skipped: progress.skipped_count,
            errors,
            lost,
            batches_committed: buffer.batches_committed(),
            backup_id: None,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            operation = %result.operation,
            status = ?result.status,
            total = result.total,
            processed = result.processed,
            success = result.success,
            failed = result.failed,
            skipped = result.skipped,
            batches = result.batches_committed,
            duration_ms = result.duration_ms,
            "run finished"
        );

        Ok(result)
    }

    async fn scan(
        &self,
        target: TargetLevel,
        scope: Option<&str>,
    ) -> Result<(Vec<Collection>, Vec<WorkItem>), PipelineError> {
        let mut collections = self
            .store
            .list_collections()
            .await
            .map_err(PipelineError::Store)?;

        if let Some(id) = scope {
            collections.retain(|c| c.id == id);
            if collections.is_empty() {
                return Err(PipelineError::Setup(format!("collection not found: {}", id)));
            }
        }

        let mut items = Vec::new();
        match target {
            TargetLevel::Collections => {
                for c in &collections {
                    items.push(WorkItem {
                        reference: c.reference(),
                        parent: None,
                    });
                }
            }
            TargetLevel::Records => {
                for (i, c) in collections.iter().enumerate() {
                    let refs = self
                        .store
                        .list_records(&c.id)
                        .await
                        .map_err(PipelineError::Store)?;
                    items.extend(refs.into_iter().map(|reference| WorkItem {
                        reference,
                        parent: Some(i),
                    }));
                }
            }
        }

        tracing::info!(
            collections = collections.len(),
            records = items.len(),
            "scan complete"
        );
        Ok((collections, items))
    }

    async fn process_one(
        &self,
        op: &dyn RecordOperation,
        reference: &RecordRef,
        parent: Option<&Collection>,
    ) -> Outcome {
        let record = match self.store.get_record(reference).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Outcome::Failed(PipelineError::Store(anyhow::anyhow!(
                    "record not found: {}",
                    reference
                )))
            }
            Err(e) => return Outcome::Failed(PipelineError::Store(e)),
        };

        if op.is_applied(&record) {
            return Outcome::Skipped;
        }

        if let Err(issue) = op.validate(&record) {
            return Outcome::Failed(PipelineError::DataShape(issue));
        }

        let derived = if op.uses_external_service() {
            let engine = self;
            let record = &record;
            self.retry
                .execute(move || async move {
                    engine.acquire_slot().await;
                    engine.call_with_timeout(op, record, parent).await
                })
                .await
        } else {
            op.apply(&record, parent).await
        };

        match derived {
            Ok(mut fields) => {
                fields.extend(op.marker_fields(&record));
                Outcome::Staged(fields)
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Wait until the outbound limiter admits one more call.
    async fn acquire_slot(&self) {
        let key = &self.settings.limiter_key;
        while !self
            .limiter
            .allow(key, self.settings.rate_limit, self.settings.rate_window)
        {
            let wait = self
                .limiter
                .retry_after(key)
                .map(|d| d.min(self.settings.poll_interval))
                .unwrap_or(self.settings.poll_interval);
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    async fn call_with_timeout(
        &self,
        op: &dyn RecordOperation,
        record: &Record,
        parent: Option<&Collection>,
    ) -> Result<FieldMap, PipelineError> {
        let limit = self.settings.call_timeout;
        match tokio::time::timeout(limit, op.apply(record, parent)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::transient(
                TransientKind::Timeout,
                format!("no response within {} ms", limit.as_millis()),
            )),
        }
    }
}

fn transition(phase: &mut RunPhase, next: RunPhase, operation: &str) {
    tracing::info!(operation, from = ?*phase, to = ?next, "run phase");
    *phase = next;
}

fn run_error(reference: &RecordRef, e: &PipelineError) -> RunError {
    RunError {
        reference: reference.clone(),
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Move records lost to a failed commit from the success column to failures.
fn absorb_commit_failure(
    e: PipelineError,
    progress: &mut ProgressState,
    errors: &mut Vec<RunError>,
    lost: &mut Vec<RecordRef>,
) {
    match e {
        PipelineError::CommitFailed { lost: refs, cause } => {
            let message = format!("batch commit failed: {:#}", cause);
            let n = refs.len() as u64;
            progress.success_count = progress.success_count.saturating_sub(n);
            progress.failure_count += n;
            for reference in &refs {
                errors.push(RunError {
                    reference: reference.clone(),
                    code: "commit_failed".to_string(),
                    message: message.clone(),
                });
            }
            lost.extend(refs);
        }
        other => errors.push(run_error(&RecordRef::collection("*"), &other)),
    }
}

/// `failed <= processed * tolerance`, inclusive at the boundary.
pub fn within_tolerance(failed: u64, processed: u64, tolerance: f64) -> bool {
    // Compare in integer space where possible to avoid 0.1 * 10 = 1.0000000000000002 surprises.
    let allowed = (processed as f64 * tolerance + 1e-9).floor() as u64;
    failed <= allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_boundary_is_inclusive() {
        assert!(within_tolerance(1, 10, 0.1));
        assert!(!within_tolerance(2, 10, 0.1));
        assert!(within_tolerance(0, 0, 0.1));
        assert!(!within_tolerance(1, 9, 0.1));
        assert!(within_tolerance(3, 3, 1.0));
        assert!(!within_tolerance(1, 100, 0.0));
    }

    #[test]
    fn cancelled_runs_end_in_their_own_phase() {
        assert_eq!(RunStatus::Completed.terminal_phase(), RunPhase::Completed);
        assert_eq!(RunStatus::Failed.terminal_phase(), RunPhase::Failed);
        assert_eq!(RunStatus::Cancelled.terminal_phase(), RunPhase::Cancelled);
    }
}
