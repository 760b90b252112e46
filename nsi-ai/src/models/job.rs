//! Normalization jobs and checkpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::RecordCategory;
use nsi_common::time::percent;

/// Job lifecycle
///
/// `pending -> active -> completed | failed | cancelled`. Cancelled, failed and
/// pending jobs may be resumed from their checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Which source rows a job enumerates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSelector {
    #[serde(default)]
    pub category: Option<RecordCategory>,
    #[serde(default)]
    pub source_table: Option<String>,
    /// Cap on the number of rows (oldest first)
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Checkpointed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: Uuid,
    pub selector: SourceSelector,
    pub status: JobStatus,
    pub total_count: u64,
    /// Records whose batch has been checkpointed
    pub processed_count: u64,
    pub current_batch_id: u64,
    /// InputError records
    pub failed_count: u64,
    pub manual_review_count: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(selector: SourceSelector, total_count: u64) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            selector,
            status: JobStatus::Pending,
            total_count,
            processed_count: 0,
            current_batch_id: 0,
            failed_count: 0,
            manual_review_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Move to a new status, stamping `ended_at` for terminal states
    pub fn transition_to(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.ended_at = Some(now);
        } else {
            self.ended_at = None;
        }
    }

    pub fn progress_percent(&self) -> f64 {
        percent(self.processed_count, self.total_count)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Monitoring view; `active` comes from the checkpoint flag
    pub fn snapshot(&self, active: bool) -> JobStatusSnapshot {
        JobStatusSnapshot {
            job_id: self.job_id,
            status: self.status,
            processed_count: self.processed_count,
            total_count: self.total_count,
            progress_percent: self.progress_percent(),
            active,
            current_batch_id: self.current_batch_id,
            failed_count: self.failed_count,
            manual_review_count: self.manual_review_count,
            error: self.error.clone(),
        }
    }
}

/// Job status as reported to dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub processed_count: u64,
    pub total_count: u64,
    pub progress_percent: f64,
    pub active: bool,
    pub current_batch_id: u64,
    pub failed_count: u64,
    pub manual_review_count: u64,
    pub error: Option<String>,
}

/// Durable progress marker, keyed by job id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    pub processed_count: u64,
    pub total_count: u64,
    pub current_batch_id: u64,
    pub failed_count: u64,
    pub manual_review_count: u64,
    pub active: bool,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a job that has not processed anything
    pub fn initial(job_id: Uuid, total_count: u64) -> Self {
        Self {
            job_id,
            processed_count: 0,
            total_count,
            current_batch_id: 0,
            failed_count: 0,
            manual_review_count: 0,
            active: false,
            timestamp: Utc::now(),
        }
    }

    pub fn progress_percent(&self) -> f64 {
        percent(self.processed_count, self.total_count)
    }
}
