//! Job rows and checkpoints

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use nsi_common::db_retry::retry_on_lock;
use nsi_common::time::parse_rfc3339;
use nsi_common::Result;

use super::{parse_column, parse_uuid, SqliteStore};
use crate::models::{BatchJob, Checkpoint, JobStatus};
use crate::repository::{CheckpointStore, JobRepository};

const JOB_COLUMNS: &str = "job_id, selector, status, total_count, processed_count, current_batch_id, \
     failed_count, manual_review_count, error, created_at, updated_at, ended_at";

fn job_from_row(row: &SqliteRow) -> Result<BatchJob> {
    let job_id: String = row.get("job_id");
    let selector: String = row.get("selector");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let ended_at: Option<String> = row.get("ended_at");
    let total_count: i64 = row.get("total_count");
    let processed_count: i64 = row.get("processed_count");
    let current_batch_id: i64 = row.get("current_batch_id");
    let failed_count: i64 = row.get("failed_count");
    let manual_review_count: i64 = row.get("manual_review_count");

    Ok(BatchJob {
        job_id: parse_uuid(&job_id)?,
        selector: serde_json::from_str(&selector)?,
        status: parse_column::<JobStatus>(&status, "status")?,
        total_count: total_count as u64,
        processed_count: processed_count as u64,
        current_batch_id: current_batch_id as u64,
        failed_count: failed_count as u64,
        manual_review_count: manual_review_count as u64,
        error: row.get("error"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
        ended_at: ended_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

#[async_trait]
impl JobRepository for SqliteStore {
    async fn save_job(&self, job: &BatchJob) -> Result<()> {
        let job_id = job.job_id.to_string();
        let selector = serde_json::to_string(&job.selector)?;
        let created_at = job.created_at.to_rfc3339();
        let updated_at = job.updated_at.to_rfc3339();
        let ended_at = job.ended_at.map(|dt| dt.to_rfc3339());

        retry_on_lock("save_job", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO batch_jobs (
                    job_id, selector, status, total_count, processed_count, current_batch_id,
                    failed_count, manual_review_count, error, created_at, updated_at, ended_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status,
                    total_count = excluded.total_count,
                    processed_count = excluded.processed_count,
                    current_batch_id = excluded.current_batch_id,
                    failed_count = excluded.failed_count,
                    manual_review_count = excluded.manual_review_count,
                    error = excluded.error,
                    updated_at = excluded.updated_at,
                    ended_at = excluded.ended_at
                "#,
            )
            .bind(&job_id)
            .bind(&selector)
            .bind(job.status.as_str())
            .bind(job.total_count as i64)
            .bind(job.processed_count as i64)
            .bind(job.current_batch_id as i64)
            .bind(job.failed_count as i64)
            .bind(job.manual_review_count as i64)
            .bind(&job.error)
            .bind(&created_at)
            .bind(&updated_at)
            .bind(&ended_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<BatchJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM batch_jobs WHERE job_id = ?", JOB_COLUMNS))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<BatchJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM batch_jobs WHERE status = ? ORDER BY created_at",
            JOB_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let job_id = checkpoint.job_id.to_string();
        let updated_at = checkpoint.timestamp.to_rfc3339();

        retry_on_lock("save_checkpoint", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (
                    job_id, processed_count, total_count, current_batch_id,
                    failed_count, manual_review_count, active, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    processed_count = excluded.processed_count,
                    total_count = excluded.total_count,
                    current_batch_id = excluded.current_batch_id,
                    failed_count = excluded.failed_count,
                    manual_review_count = excluded.manual_review_count,
                    active = excluded.active,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&job_id)
            .bind(checkpoint.processed_count as i64)
            .bind(checkpoint.total_count as i64)
            .bind(checkpoint.current_batch_id as i64)
            .bind(checkpoint.failed_count as i64)
            .bind(checkpoint.manual_review_count as i64)
            .bind(checkpoint.active)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT processed_count, total_count, current_batch_id, failed_count,
                    manual_review_count, active, updated_at
             FROM checkpoints WHERE job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let processed_count: i64 = row.get("processed_count");
        let total_count: i64 = row.get("total_count");
        let current_batch_id: i64 = row.get("current_batch_id");
        let failed_count: i64 = row.get("failed_count");
        let manual_review_count: i64 = row.get("manual_review_count");
        let updated_at: String = row.get("updated_at");

        Ok(Some(Checkpoint {
            job_id,
            processed_count: processed_count as u64,
            total_count: total_count as u64,
            current_batch_id: current_batch_id as u64,
            failed_count: failed_count as u64,
            manual_review_count: manual_review_count as u64,
            active: row.get("active"),
            timestamp: parse_rfc3339(&updated_at)?,
        }))
    }
}
