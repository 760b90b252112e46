//! Persistence interfaces
//!
//! Domain code (pipeline, matchers, quality analyzer) depends only on these traits;
//! [`crate::db::SqliteStore`] implements all of them.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use nsi_common::Result;

use crate::models::{
    BatchJob, Benchmark, Checkpoint, ClassificationResult, JobStatus, NewBenchmark,
    NewSourceRecord, NormalizationRecord, QualityScope, RecordCategory, ReferenceEntry,
    ReferenceTable, SourceSelector,
};

#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Store imported rows; returns their ids in input order
    async fn insert_source_records(&self, records: &[NewSourceRecord]) -> Result<Vec<i64>>;

    async fn count_source_records(&self, selector: &SourceSelector) -> Result<u64>;

    /// Freeze the rows matched by `selector` into the job's stable processing order
    ///
    /// Returns the number of records enumerated.
    async fn enumerate_job_records(&self, job_id: Uuid, selector: &SourceSelector) -> Result<u64>;

    /// Records of a job by position, `offset` inclusive
    async fn load_job_records(
        &self,
        job_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NormalizationRecord>>;
}

#[async_trait]
pub trait ReferenceRepository: Send + Sync {
    /// Insert or replace entries keyed by `(table, code)`; returns rows written
    async fn upsert_reference_entries(&self, entries: &[ReferenceEntry]) -> Result<u64>;

    async fn load_reference_table(&self, table: ReferenceTable) -> Result<Vec<ReferenceEntry>>;
}

#[async_trait]
pub trait BenchmarkRepository: Send + Sync {
    /// Insert or replace benchmarks keyed by `(category, normalized name)`
    async fn upsert_benchmarks(&self, benchmarks: &[NewBenchmark]) -> Result<Vec<i64>>;

    async fn load_approved_benchmarks(&self) -> Result<Vec<Benchmark>>;
}

/// Result joined with the source row it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ResultWithRecord {
    pub result: ClassificationResult,
    pub category: RecordCategory,
    pub source_table: String,
    pub raw_name: String,
    pub raw_code: Option<String>,
}

#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Insert or replace the result for `(job_id, record_id)`
    async fn upsert_result(&self, result: &ClassificationResult) -> Result<()>;

    async fn load_results(&self, scope: &QualityScope) -> Result<Vec<ResultWithRecord>>;

    async fn load_job_results(&self, job_id: Uuid) -> Result<Vec<ClassificationResult>>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or update
    async fn save_job(&self, job: &BatchJob) -> Result<()>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<BatchJob>>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<BatchJob>>;
}

/// Durable checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>>;
}

/// Key/value settings (provider API keys and similar)
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Every repository the services need, as trait objects
#[derive(Clone)]
pub struct Repositories {
    pub records: Arc<dyn RecordRepository>,
    pub references: Arc<dyn ReferenceRepository>,
    pub benchmarks: Arc<dyn BenchmarkRepository>,
    pub results: Arc<dyn ResultRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub settings: Arc<dyn SettingsRepository>,
}

impl Repositories {
    /// All repositories backed by one store
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: RecordRepository
            + ReferenceRepository
            + BenchmarkRepository
            + ResultRepository
            + JobRepository
            + CheckpointStore
            + SettingsRepository
            + 'static,
    {
        Self {
            records: store.clone(),
            references: store.clone(),
            benchmarks: store.clone(),
            results: store.clone(),
            jobs: store.clone(),
            checkpoints: store.clone(),
            settings: store,
        }
    }
}
