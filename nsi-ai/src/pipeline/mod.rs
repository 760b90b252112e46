//! Classification pipeline
//!
//! Drives every record of a job through the ordered stages:
//!
//! 1. Preprocess (validation, whitespace cleanup)
//! 2. Reference lookup (exact code, then fuzzy name, tables in priority order)
//! 3. Benchmark match
//! 4. AI classification through the batch processor
//! 5. Confidence thresholding (low confidence is flagged for manual review)
//! 6. Persistence of the `ClassificationResult`
//!
//! A fixed pool of workers pulls records from a shared queue, one checkpointed batch
//! at a time. Each worker takes up to one AI batch worth of records per pull and runs
//! them concurrently, so AI-bound records reach the batch processor together.
//! Rate-limited records go back to the end of the queue.

pub mod checkpoint;
pub mod jobs;
pub mod preprocess;
pub mod stages;

pub use checkpoint::CheckpointManager;
pub use jobs::JobManager;
pub use preprocess::{InputError, PreparedItem};
pub use stages::{StageSummary, StageTracker};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nsi_common::config::PipelineSettings;
use nsi_common::events::{EventBus, NsiEvent};

use crate::gateway::{BatchProcessor, GatewayError};
use crate::matchers::{BenchmarkMatcher, MatchCandidate, MatchOutcome, ReferenceMatcherSet};
use crate::models::{
    BatchJob, Checkpoint, JobStatus, NormalizationRecord, PipelineStage, RawItem, Resolution,
    ResolutionMethod,
};
use crate::providers::ClassificationRequest;
use crate::repository::{JobRepository, RecordRepository, Repositories, ResultRepository};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed record; recorded, never retried
    #[error("Invalid input{}: {reason}", record_suffix(.record_id))]
    Input {
        record_id: Option<i64>,
        reason: String,
    },

    /// Every provider circuit is open and manual-review fallback is disabled
    #[error("Provider exhausted: {0}")]
    ProviderExhausted(GatewayError),

    /// Fatal for the job
    #[error("Checkpoint persistence failed: {0}")]
    Checkpoint(String),

    #[error("Storage error: {0}")]
    Storage(#[from] nsi_common::Error),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot run from status {status}")]
    JobNotRunnable { job_id: Uuid, status: JobStatus },
}

fn record_suffix(record_id: &Option<i64>) -> String {
    record_id
        .map(|id| format!(" (record {})", id))
        .unwrap_or_default()
}

/// Final job state plus the error that ended it, if any
#[derive(Debug)]
pub struct RunOutcome {
    pub job: BatchJob,
    pub error: Option<PipelineError>,
}

/// Result of the deterministic stages (1-3)
enum Deterministic {
    Done(Resolution),
    NeedsAi {
        item: PreparedItem,
        /// Best below-threshold candidate, kept in case AI cannot help
        fallback: Option<MatchCandidate>,
    },
}

enum ItemOutcome {
    Resolved(Resolution),
    /// Rate limited; retry stage 4 later
    Requeue {
        item: PreparedItem,
        fallback: Option<MatchCandidate>,
        error: GatewayError,
    },
}

struct WorkItem {
    record: NormalizationRecord,
    pending_ai: Option<(PreparedItem, Option<MatchCandidate>)>,
    requeues: u32,
}

#[derive(Debug, Default)]
struct BatchTally {
    processed: AtomicU64,
    failed: AtomicU64,
    manual_review: AtomicU64,
}

/// Shared state of the workers processing one batch
struct BatchContext<'a> {
    job_id: Uuid,
    queue: Mutex<VecDeque<WorkItem>>,
    tally: BatchTally,
    tracker: &'a StageTracker,
    cancel: &'a CancellationToken,
    /// Records processed before this batch
    base_processed: u64,
    total_count: u64,
}

impl BatchContext<'_> {
    fn pop_many(&self, max: usize) -> Vec<WorkItem> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    fn push(&self, work: WorkItem) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(work);
    }
}

pub struct ClassificationPipeline {
    settings: PipelineSettings,
    references: Arc<ReferenceMatcherSet>,
    benchmarks: Arc<BenchmarkMatcher>,
    ai: Arc<BatchProcessor>,
    records: Arc<dyn RecordRepository>,
    results: Arc<dyn ResultRepository>,
    jobs: Arc<dyn JobRepository>,
    checkpoints: Arc<CheckpointManager>,
    event_bus: EventBus,
    trackers: RwLock<HashMap<Uuid, Arc<StageTracker>>>,
}

impl ClassificationPipeline {
    pub fn new(
        settings: PipelineSettings,
        references: Arc<ReferenceMatcherSet>,
        benchmarks: Arc<BenchmarkMatcher>,
        ai: Arc<BatchProcessor>,
        repositories: &Repositories,
        checkpoints: Arc<CheckpointManager>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            settings,
            references,
            benchmarks,
            ai,
            records: repositories.records.clone(),
            results: repositories.results.clone(),
            jobs: repositories.jobs.clone(),
            checkpoints,
            event_bus,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Process a job from its last checkpoint until done, cancelled or failed
    ///
    /// The job row and checkpoint are persisted on every exit path except a failing
    /// store.
    pub async fn run(&self, mut job: BatchJob, cancel: CancellationToken) -> RunOutcome {
        let job_id = job.job_id;
        let tracker = Arc::new(StageTracker::new());
        self.trackers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, tracker.clone());

        let error = match self.drive(&mut job, &tracker, &cancel).await {
            Ok(()) => None,
            Err(err) => {
                self.fail_job(&mut job, &err).await;
                Some(err)
            }
        };

        self.trackers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        RunOutcome { job, error }
    }

    async fn drive(
        &self,
        job: &mut BatchJob,
        tracker: &StageTracker,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut checkpoint = self
            .checkpoints
            .resume(job.job_id)
            .await?
            .unwrap_or_else(|| Checkpoint::initial(job.job_id, job.total_count));
        let resumed_from = checkpoint.processed_count;

        checkpoint.total_count = job.total_count;
        checkpoint.active = true;
        sync_counts(job, &checkpoint);
        job.error = None;
        job.transition_to(JobStatus::Active);
        self.jobs.save_job(job).await?;
        checkpoint = self.checkpoints.save(&checkpoint).await?;

        info!(
            job_id = %job.job_id,
            total = job.total_count,
            resumed_from,
            workers = self.settings.workers,
            "Normalization job started"
        );
        self.event_bus.emit_lossy(NsiEvent::JobStarted {
            job_id: job.job_id,
            total_count: job.total_count,
            resumed_from,
            timestamp: Utc::now(),
        });

        let batch_size = self.settings.checkpoint_batch_size.max(1) as u64;
        while checkpoint.processed_count < checkpoint.total_count {
            if cancel.is_cancelled() {
                break;
            }
            let records = self
                .records
                .load_job_records(job.job_id, checkpoint.processed_count, batch_size)
                .await?;
            if records.is_empty() {
                warn!(
                    job_id = %job.job_id,
                    processed = checkpoint.processed_count,
                    total = checkpoint.total_count,
                    "Fewer enumerated records than expected; closing job at processed count"
                );
                checkpoint.total_count = checkpoint.processed_count;
                job.total_count = checkpoint.processed_count;
                break;
            }

            let batch_len = records.len() as u64;
            let ctx = BatchContext {
                job_id: job.job_id,
                queue: Mutex::new(records.into_iter().map(WorkItem::new).collect()),
                tally: BatchTally::default(),
                tracker,
                cancel,
                base_processed: checkpoint.processed_count,
                total_count: checkpoint.total_count,
            };
            self.process_batch(&ctx).await?;

            let processed = ctx.tally.processed.load(Ordering::Relaxed);
            if processed < batch_len {
                // Interrupted; the whole batch runs again on resume
                debug!(
                    job_id = %job.job_id,
                    batch_id = checkpoint.current_batch_id,
                    processed,
                    batch_len,
                    "Batch interrupted before completion"
                );
                break;
            }

            checkpoint.processed_count += processed;
            checkpoint.current_batch_id += 1;
            checkpoint.failed_count += ctx.tally.failed.load(Ordering::Relaxed);
            checkpoint.manual_review_count += ctx.tally.manual_review.load(Ordering::Relaxed);
            checkpoint = self.checkpoints.save(&checkpoint).await?;

            sync_counts(job, &checkpoint);
            job.updated_at = Utc::now();
            self.jobs.save_job(job).await?;

            self.event_bus.emit_lossy(NsiEvent::BatchCheckpointed {
                job_id: job.job_id,
                batch_id: checkpoint.current_batch_id,
                processed_count: checkpoint.processed_count,
                total_count: checkpoint.total_count,
                timestamp: Utc::now(),
            });
            self.emit_progress(job.job_id, checkpoint.processed_count, checkpoint.total_count);
        }

        checkpoint.active = false;
        let finished = checkpoint.processed_count >= checkpoint.total_count;
        self.checkpoints.save(&checkpoint).await?;
        sync_counts(job, &checkpoint);

        if !finished && cancel.is_cancelled() {
            job.transition_to(JobStatus::Cancelled);
            self.jobs.save_job(job).await?;
            info!(
                job_id = %job.job_id,
                processed = job.processed_count,
                total = job.total_count,
                "Normalization job cancelled"
            );
            self.event_bus.emit_lossy(NsiEvent::JobCancelled {
                job_id: job.job_id,
                processed_count: job.processed_count,
                timestamp: Utc::now(),
            });
            return Ok(());
        }

        job.transition_to(JobStatus::Completed);
        self.jobs.save_job(job).await?;
        let duration_seconds = started.elapsed().as_secs();
        info!(
            job_id = %job.job_id,
            processed = job.processed_count,
            failed = job.failed_count,
            manual_review = job.manual_review_count,
            duration_seconds,
            "Normalization job completed"
        );
        self.event_bus.emit_lossy(NsiEvent::JobCompleted {
            job_id: job.job_id,
            processed_count: job.processed_count,
            failed_count: job.failed_count,
            manual_review_count: job.manual_review_count,
            duration_seconds,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn fail_job(&self, job: &mut BatchJob, err: &PipelineError) {
        error!(job_id = %job.job_id, error = %err, "Normalization job failed");
        job.error = Some(err.to_string());
        job.transition_to(JobStatus::Failed);
        if let Err(e) = self.jobs.save_job(job).await {
            error!(job_id = %job.job_id, error = %e, "Failed to persist failed job status");
        }
        if let Err(e) = self.checkpoints.mark_inactive(job.job_id).await {
            error!(job_id = %job.job_id, error = %e, "Failed to clear checkpoint active flag");
        }
        self.event_bus.emit_lossy(NsiEvent::JobFailed {
            job_id: job.job_id,
            error: err.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn process_batch(&self, ctx: &BatchContext<'_>) -> Result<(), PipelineError> {
        let workers = (0..self.settings.workers.max(1)).map(|worker| self.worker(worker, ctx));
        futures::future::try_join_all(workers).await?;
        Ok(())
    }

    async fn worker(&self, worker: usize, ctx: &BatchContext<'_>) -> Result<(), PipelineError> {
        let pull = self.ai.max_batch_size();
        loop {
            if ctx.cancel.is_cancelled() {
                debug!(job_id = %ctx.job_id, worker, "Worker stopping on cancellation");
                return Ok(());
            }
            let pulled = ctx.pop_many(pull);
            if pulled.is_empty() {
                return Ok(());
            }

            let in_flight = pulled.len();
            let runs = futures::future::try_join_all(pulled.into_iter().map(|work| self.process(ctx, work)));
            tokio::select! {
                finished = runs => {
                    finished?;
                }
                _ = ctx.cancel.cancelled() => {
                    // Unfinished records leave the batch incomplete; it reruns on resume
                    debug!(job_id = %ctx.job_id, worker, in_flight, "Worker abandoning records on cancellation");
                    return Ok(());
                }
            }
        }
    }

    /// One record through every stage, or back onto the queue when rate limited
    async fn process(&self, ctx: &BatchContext<'_>, mut work: WorkItem) -> Result<(), PipelineError> {
        let outcome = match work.pending_ai.take() {
            Some((item, fallback)) => self.resolve_ai(item, fallback, work.requeues, ctx.tracker).await?,
            None => {
                let prepared = preprocess::prepare_record(&work.record);
                match self.resolve_deterministic(prepared, ctx.tracker).await? {
                    Deterministic::Done(resolution) => ItemOutcome::Resolved(resolution),
                    Deterministic::NeedsAi { item, fallback } => {
                        self.resolve_ai(item, fallback, work.requeues, ctx.tracker).await?
                    }
                }
            }
        };

        match outcome {
            ItemOutcome::Resolved(resolution) => {
                self.persist(ctx, &work.record, resolution).await?;
            }
            ItemOutcome::Requeue {
                item,
                fallback,
                error,
            } => {
                work.requeues += 1;
                debug!(
                    job_id = %ctx.job_id,
                    record_id = work.record.id,
                    requeues = work.requeues,
                    error = %error,
                    "Record requeued"
                );
                work.pending_ai = Some((item, fallback));
                ctx.push(work);
            }
        }
        Ok(())
    }

    /// Stages 1-3
    async fn resolve_deterministic(
        &self,
        prepared: Result<PreparedItem, InputError>,
        tracker: &StageTracker,
    ) -> Result<Deterministic, PipelineError> {
        tracker.enter(PipelineStage::Preprocess);
        let item = match prepared {
            Ok(item) => {
                tracker.complete(PipelineStage::Preprocess, None);
                item
            }
            Err(reason) => {
                tracker.fail(PipelineStage::Preprocess);
                return Ok(Deterministic::Done(Resolution::input_error(reason.to_string())));
            }
        };

        tracker.enter(PipelineStage::ReferenceLookup);
        let reference = match self.references.lookup(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracker.fail(PipelineStage::ReferenceLookup);
                return Err(e.into());
            }
        };
        if let MatchOutcome::Accepted(candidate) = reference {
            tracker.complete(PipelineStage::ReferenceLookup, Some(candidate.score));
            return Ok(Deterministic::Done(candidate.into_resolution()));
        }
        tracker.complete(PipelineStage::ReferenceLookup, None);
        let mut fallback = reference.into_rejected();

        tracker.enter(PipelineStage::BenchmarkMatch);
        let benchmark = match self.benchmarks.best_match(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracker.fail(PipelineStage::BenchmarkMatch);
                return Err(e.into());
            }
        };
        if let MatchOutcome::Accepted(candidate) = benchmark {
            tracker.complete(PipelineStage::BenchmarkMatch, Some(candidate.score));
            return Ok(Deterministic::Done(candidate.into_resolution()));
        }
        tracker.complete(PipelineStage::BenchmarkMatch, None);
        fallback = crate::matchers::better(fallback, benchmark.into_rejected());

        Ok(Deterministic::NeedsAi { item, fallback })
    }

    /// Stage 4
    async fn resolve_ai(
        &self,
        item: PreparedItem,
        fallback: Option<MatchCandidate>,
        requeues: u32,
        tracker: &StageTracker,
    ) -> Result<ItemOutcome, PipelineError> {
        tracker.enter(PipelineStage::AiClassification);
        let request = ClassificationRequest::new(item.category, item.name.clone(), item.code.clone());

        let err = match self.ai.submit(request).await {
            Ok(answer) => {
                let confidence = answer.confidence.clamp(0.0, 1.0);
                tracker.complete(PipelineStage::AiClassification, Some(confidence));
                return Ok(ItemOutcome::Resolved(Resolution {
                    stage_reached: PipelineStage::AiClassification,
                    method: ResolutionMethod::Ai,
                    category_code: Some(answer.code),
                    category_name: Some(answer.name),
                    reference_table: None,
                    matched_reference_id: None,
                    confidence: Some(confidence),
                    manual_review: confidence < self.settings.ai_min_confidence,
                    provider_used: Some(answer.provider_used),
                    error: None,
                }));
            }
            Err(err) => err,
        };

        if matches!(err, GatewayError::RateLimitExceeded { .. }) && requeues < self.settings.max_requeues
        {
            tracker.abandon(PipelineStage::AiClassification);
            return Ok(ItemOutcome::Requeue {
                item,
                fallback,
                error: err,
            });
        }

        tracker.fail(PipelineStage::AiClassification);
        if let GatewayError::ProviderExhausted {
            all_circuits_open: true,
            ..
        } = &err
        {
            if !self.settings.fallback_to_manual_review {
                return Err(PipelineError::ProviderExhausted(err));
            }
        }

        warn!(
            name = %item.name,
            error = %err,
            has_fallback = fallback.is_some(),
            "AI classification unavailable; sending record to manual review"
        );
        let reason = err.to_string();
        Ok(ItemOutcome::Resolved(match fallback {
            Some(candidate) => candidate.into_fallback(reason),
            None => Resolution::unresolved(PipelineStage::AiClassification, reason),
        }))
    }

    /// Stage 5
    fn apply_threshold(&self, mut resolution: Resolution, tracker: &StageTracker) -> Resolution {
        if resolution.is_input_error() {
            return resolution;
        }
        tracker.enter(PipelineStage::ConfidenceThreshold);
        match resolution.confidence {
            Some(confidence) if confidence < self.settings.manual_review_threshold => {
                resolution.manual_review = true;
            }
            None => resolution.manual_review = true,
            _ => {}
        }
        tracker.complete(PipelineStage::ConfidenceThreshold, resolution.confidence);
        resolution
    }

    /// Stages 5 and 6 for a job record
    async fn persist(
        &self,
        ctx: &BatchContext<'_>,
        record: &NormalizationRecord,
        resolution: Resolution,
    ) -> Result<(), PipelineError> {
        let resolution = self.apply_threshold(resolution, ctx.tracker);
        let result = resolution.into_result(ctx.job_id, record.id);

        ctx.tracker.enter(PipelineStage::Persistence);
        if let Err(e) = self.results.upsert_result(&result).await {
            ctx.tracker.fail(PipelineStage::Persistence);
            return Err(e.into());
        }
        ctx.tracker.complete(PipelineStage::Persistence, None);

        debug!(
            job_id = %ctx.job_id,
            record_id = record.id,
            method = %result.method.as_str(),
            stage = %result.stage_reached.as_str(),
            confidence = ?result.confidence,
            manual_review = result.manual_review,
            "Record resolved"
        );

        if result.method == ResolutionMethod::None {
            ctx.tally.failed.fetch_add(1, Ordering::Relaxed);
        } else if result.manual_review {
            ctx.tally.manual_review.fetch_add(1, Ordering::Relaxed);
        }
        if result.manual_review {
            self.event_bus.emit_lossy(NsiEvent::RecordFlaggedForReview {
                job_id: ctx.job_id,
                record_id: record.id,
                reason: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "confidence below threshold".to_string()),
                timestamp: Utc::now(),
            });
        }

        let done = ctx.tally.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % 10 == 0 {
            self.emit_progress(ctx.job_id, ctx.base_processed + done, ctx.total_count);
        }
        Ok(())
    }

    fn emit_progress(&self, job_id: Uuid, processed_count: u64, total_count: u64) {
        self.event_bus.emit_lossy(NsiEvent::JobProgress {
            job_id,
            processed_count,
            total_count,
            progress_percent: nsi_common::time::percent(processed_count, total_count),
            timestamp: Utc::now(),
        });
    }

    /// Classify one item outside any job (nothing is persisted)
    ///
    /// Rate-limited attempts are retried inline up to `max_requeues` times.
    pub async fn classify_item(&self, raw: &RawItem) -> Result<Resolution, PipelineError> {
        let tracker = StageTracker::new();
        let prepared = preprocess::prepare_raw(raw).map_err(|e| PipelineError::Input {
            record_id: None,
            reason: e.to_string(),
        })?;

        let mut requeues = 0;
        let mut outcome = match self.resolve_deterministic(Ok(prepared), &tracker).await? {
            Deterministic::Done(resolution) => ItemOutcome::Resolved(resolution),
            Deterministic::NeedsAi { item, fallback } => {
                self.resolve_ai(item, fallback, requeues, &tracker).await?
            }
        };
        loop {
            match outcome {
                ItemOutcome::Resolved(resolution) => {
                    return Ok(self.apply_threshold(resolution, &tracker));
                }
                ItemOutcome::Requeue { item, fallback, .. } => {
                    requeues += 1;
                    outcome = self.resolve_ai(item, fallback, requeues, &tracker).await?;
                }
            }
        }
    }

    /// Stage summaries: live counters while the job runs, rebuilt from results otherwise
    pub async fn stage_summaries(&self, job_id: Uuid) -> Result<Vec<StageSummary>, PipelineError> {
        let live = self
            .trackers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned();
        if let Some(tracker) = live {
            return Ok(tracker.summaries());
        }
        let results = self.results.load_job_results(job_id).await?;
        Ok(StageTracker::from_results(&results).summaries())
    }
}

impl WorkItem {
    fn new(record: NormalizationRecord) -> Self {
        Self {
            record,
            pending_ai: None,
            requeues: 0,
        }
    }
}

fn sync_counts(job: &mut BatchJob, checkpoint: &Checkpoint) {
    job.processed_count = checkpoint.processed_count;
    job.current_batch_id = checkpoint.current_batch_id;
    job.failed_count = checkpoint.failed_count;
    job.manual_review_count = checkpoint.manual_review_count;
}
