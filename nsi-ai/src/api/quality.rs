//! GET /api/quality/report?job_id=&category=

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use crate::error::ApiResult;
use crate::models::{QualityReport, QualityScope};
use crate::AppState;

/// Report for the given scope; no parameters covers every stored result
pub async fn quality_report(
    State(state): State<AppState>,
    Query(scope): Query<QualityScope>,
) -> ApiResult<Json<QualityReport>> {
    if let Some(job_id) = scope.job_id {
        // 404 for unknown jobs
        state.container.jobs.job_status(job_id).await?;
    }
    let report = state.container.quality.report(&scope).await?;
    Ok(Json(report.as_ref().clone()))
}

pub fn quality_routes() -> Router<AppState> {
    Router::new().route("/api/quality/report", get(quality_report))
}
