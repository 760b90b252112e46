//! Checkpoint manager
//!
//! Progress is persisted after every batch boundary. All writes go through one async
//! mutex so two saves for the same job can never interleave; the last saved state is
//! also kept in memory for cheap monitoring reads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PipelineError;
use crate::models::Checkpoint;
use crate::repository::CheckpointStore;

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    writer: Mutex<()>,
    latest: RwLock<HashMap<Uuid, Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Persist a checkpoint (stamped with the current time)
    ///
    /// Any failure is a [`PipelineError::Checkpoint`]; callers treat it as fatal.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<Checkpoint, PipelineError> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.timestamp = Utc::now();

        let _guard = self.writer.lock().await;
        self.store
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?;

        self.latest
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.job_id, checkpoint.clone());

        tracing::debug!(
            job_id = %checkpoint.job_id,
            processed = checkpoint.processed_count,
            total = checkpoint.total_count,
            batch_id = checkpoint.current_batch_id,
            active = checkpoint.active,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Last durable checkpoint of a job
    pub async fn resume(&self, job_id: Uuid) -> Result<Option<Checkpoint>, PipelineError> {
        let checkpoint = self
            .store
            .load_checkpoint(job_id)
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?;

        if let Some(cp) = &checkpoint {
            tracing::info!(
                job_id = %job_id,
                processed = cp.processed_count,
                total = cp.total_count,
                batch_id = cp.current_batch_id,
                "Resuming from checkpoint"
            );
        }
        Ok(checkpoint)
    }

    /// Clear the `active` flag, keeping the counts
    pub async fn mark_inactive(&self, job_id: Uuid) -> Result<Option<Checkpoint>, PipelineError> {
        let Some(mut checkpoint) = self.status(job_id).await? else {
            return Ok(None);
        };
        checkpoint.active = false;
        self.save(&checkpoint).await.map(Some)
    }

    /// Latest checkpoint, from memory when this process wrote it
    pub async fn status(&self, job_id: Uuid) -> Result<Option<Checkpoint>, PipelineError> {
        let cached = self
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned();
        match cached {
            Some(checkpoint) => Ok(Some(checkpoint)),
            None => self
                .store
                .load_checkpoint(job_id)
                .await
                .map_err(|e| PipelineError::Checkpoint(e.to_string())),
        }
    }
}
