//! Job control: start, cancel, status, resume
//!
//! Each running job is a spawned task holding its own cancellation token. Jobs left
//! `active` by a crash are picked up by [`JobManager::resume_interrupted`] at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ClassificationPipeline, PipelineError, RunOutcome};
use crate::models::{BatchJob, Checkpoint, JobStatus, JobStatusSnapshot, SourceSelector};
use crate::repository::{JobRepository, RecordRepository, Repositories};

struct RunningJob {
    cancel: CancellationToken,
    handle: JoinHandle<RunOutcome>,
}

pub struct JobManager {
    pipeline: Arc<ClassificationPipeline>,
    records: Arc<dyn RecordRepository>,
    jobs: Arc<dyn JobRepository>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
}

impl JobManager {
    pub fn new(pipeline: Arc<ClassificationPipeline>, repositories: &Repositories) -> Self {
        Self {
            pipeline,
            records: repositories.records.clone(),
            jobs: repositories.jobs.clone(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<ClassificationPipeline> {
        &self.pipeline
    }

    /// Enumerate the selected records into a new job and start processing
    pub async fn start_job(&self, selector: SourceSelector) -> Result<Uuid, PipelineError> {
        let mut job = BatchJob::new(selector, 0);
        job.total_count = self
            .records
            .enumerate_job_records(job.job_id, &job.selector)
            .await?;
        self.jobs.save_job(&job).await?;

        info!(
            job_id = %job.job_id,
            total = job.total_count,
            category = ?job.selector.category,
            source_table = ?job.selector.source_table,
            "Normalization job created"
        );

        let job_id = job.job_id;
        self.spawn(job).await;
        Ok(job_id)
    }

    async fn spawn(&self, job: BatchJob) {
        let job_id = job.job_id;
        let cancel = CancellationToken::new();
        let pipeline = self.pipeline.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { pipeline.run(job, token).await });

        let mut running = self.running.lock().await;
        prune_finished(&mut running);
        running.insert(job_id, RunningJob { cancel, handle });
    }

    /// Jobs whose task is still running
    ///
    /// Finished runs nobody waited for are forgotten here; their outcome stays in the
    /// job store.
    pub async fn running_jobs(&self) -> usize {
        let mut running = self.running.lock().await;
        prune_finished(&mut running);
        running.len()
    }

    async fn is_running(&self, job_id: Uuid) -> bool {
        self.running
            .lock()
            .await
            .get(&job_id)
            .is_some_and(|job| !job.handle.is_finished())
    }

    async fn load(&self, job_id: Uuid) -> Result<BatchJob, PipelineError> {
        self.jobs
            .load_job(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))
    }

    /// Signal a running job to stop; it reports `cancelled` once in-flight records finish
    ///
    /// A pending job that never started is cancelled directly.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), PipelineError> {
        if let Some(running) = self.running.lock().await.get(&job_id) {
            if !running.handle.is_finished() {
                info!(job_id = %job_id, "Cancellation requested");
                running.cancel.cancel();
                return Ok(());
            }
        }

        let mut job = self.load(job_id).await?;
        match job.status {
            JobStatus::Pending | JobStatus::Active => {
                job.transition_to(JobStatus::Cancelled);
                self.jobs.save_job(&job).await?;
                self.pipeline.checkpoints().mark_inactive(job_id).await?;
                info!(job_id = %job_id, "Idle job cancelled");
                Ok(())
            }
            status => Err(PipelineError::JobNotRunnable { job_id, status }),
        }
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusSnapshot, PipelineError> {
        let job = self.load(job_id).await?;
        let checkpoint = self.pipeline.checkpoints().status(job_id).await?;
        let active = checkpoint.as_ref().is_some_and(|cp| cp.active) && self.is_running(job_id).await;

        let mut snapshot = job.snapshot(active);
        // The checkpoint may be ahead of the job row for a moment after a batch
        if let Some(cp) = checkpoint.filter(|cp| cp.processed_count > job.processed_count) {
            snapshot.processed_count = cp.processed_count;
            snapshot.current_batch_id = cp.current_batch_id;
            snapshot.progress_percent = cp.progress_percent();
        }
        Ok(snapshot)
    }

    /// Latest checkpoint of a job
    pub async fn checkpoint(&self, job_id: Uuid) -> Result<Checkpoint, PipelineError> {
        let job = self.load(job_id).await?;
        Ok(self
            .pipeline
            .checkpoints()
            .status(job_id)
            .await?
            .unwrap_or_else(|| Checkpoint::initial(job_id, job.total_count)))
    }

    /// Continue a pending, failed or cancelled job from its checkpoint
    pub async fn resume_job(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let job = self.load(job_id).await?;
        if self.is_running(job_id).await || !job.status.is_resumable() {
            return Err(PipelineError::JobNotRunnable {
                job_id,
                status: job.status,
            });
        }
        info!(job_id = %job_id, status = %job.status, "Resuming job");
        self.spawn(job).await;
        Ok(())
    }

    /// Handle jobs a previous process left `active`
    ///
    /// With `resume_on_startup` they are restarted from their checkpoints; otherwise
    /// they are parked as `pending`. Returns the affected job ids.
    pub async fn resume_interrupted(&self) -> Result<Vec<Uuid>, PipelineError> {
        let interrupted = self.jobs.list_jobs_by_status(JobStatus::Active).await?;
        let mut ids = Vec::with_capacity(interrupted.len());

        for mut job in interrupted {
            if self.is_running(job.job_id).await {
                continue;
            }
            ids.push(job.job_id);
            if self.pipeline.settings().resume_on_startup {
                info!(job_id = %job.job_id, processed = job.processed_count, "Resuming interrupted job");
                self.spawn(job).await;
            } else {
                warn!(job_id = %job.job_id, "Interrupted job parked as pending");
                job.transition_to(JobStatus::Pending);
                self.jobs.save_job(&job).await?;
                self.pipeline.checkpoints().mark_inactive(job.job_id).await?;
            }
        }
        Ok(ids)
    }

    /// Wait for a spawned run to finish
    ///
    /// Returns `None` when the job is not tracked by this manager, including runs that
    /// finished and were pruned before anyone waited.
    pub async fn wait(&self, job_id: Uuid) -> Option<RunOutcome> {
        let running = self.running.lock().await.remove(&job_id)?;
        match running.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job task panicked");
                None
            }
        }
    }

    /// Cancel every running job and wait for them to checkpoint
    pub async fn shutdown(&self) {
        let running: Vec<(Uuid, RunningJob)> = self.running.lock().await.drain().collect();
        for (_, job) in &running {
            job.cancel.cancel();
        }
        for (job_id, job) in running {
            if let Err(e) = job.handle.await {
                tracing::error!(job_id = %job_id, error = %e, "Job task panicked during shutdown");
            }
        }
    }
}

fn prune_finished(running: &mut HashMap<Uuid, RunningJob>) {
    let before = running.len();
    running.retain(|_, job| !job.handle.is_finished());
    let pruned = before - running.len();
    if pruned > 0 {
        tracing::debug!(pruned, "Dropped handles of finished job runs");
    }
}
