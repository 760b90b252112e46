//! Job control API
//!
//! POST /api/jobs, GET /api/jobs/:job_id, POST cancel/resume, GET checkpoint/stages

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{Checkpoint, JobStatusSnapshot, SourceSelector};
use crate::pipeline::StageSummary;
use crate::AppState;

/// POST /api/jobs response
#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
}

/// GET /api/jobs/:job_id/checkpoint response
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointResponse {
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    pub progress_percent: f64,
}

/// POST /api/jobs
///
/// Enumerates the selected records and starts processing in the background.
pub async fn start_job(
    State(state): State<AppState>,
    Json(selector): Json<SourceSelector>,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)> {
    let job_id = state.container.jobs.start_job(selector).await?;
    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// GET /api/jobs/:job_id
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusSnapshot>> {
    Ok(Json(state.container.jobs.job_status(job_id).await?))
}

/// POST /api/jobs/:job_id/cancel
///
/// Returns immediately; a running job reports `cancelled` once its in-flight records finish.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobStatusSnapshot>)> {
    state.container.jobs.cancel_job(job_id).await?;
    let snapshot = state.container.jobs.job_status(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// POST /api/jobs/:job_id/resume
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)> {
    state.container.jobs.resume_job(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// GET /api/jobs/:job_id/checkpoint
pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<CheckpointResponse>> {
    let checkpoint = state.container.jobs.checkpoint(job_id).await?;
    Ok(Json(CheckpointResponse {
        progress_percent: checkpoint.progress_percent(),
        checkpoint,
    }))
}

/// GET /api/jobs/:job_id/stages
pub async fn get_stage_summaries(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Vec<StageSummary>>> {
    // 404 for unknown jobs rather than six empty stages
    state.container.jobs.job_status(job_id).await?;
    Ok(Json(state.container.pipeline.stage_summaries(job_id).await?))
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", post(start_job))
        .route("/api/jobs/:job_id", get(get_job_status))
        .route("/api/jobs/:job_id/cancel", post(cancel_job))
        .route("/api/jobs/:job_id/resume", post(resume_job))
        .route("/api/jobs/:job_id/checkpoint", get(get_checkpoint))
        .route("/api/jobs/:job_id/stages", get(get_stage_summaries))
}
