//! Provider profiles and benchmark runs

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::gateway::BenchmarkReport;
use crate::models::ProviderProfile;
use crate::AppState;

/// Upper bound on samples per provider for one request
const MAX_SAMPLES: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct BenchmarkRequest {
    /// Defaults to `gateway.sample_requests`
    #[serde(default)]
    pub samples: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkResponse {
    pub reports: Vec<BenchmarkReport>,
    /// Provider order after the run
    pub ranking: Vec<String>,
}

/// GET /api/providers
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderProfile>> {
    Json(state.container.gateway.profiles())
}

/// POST /api/providers/benchmark
pub async fn run_benchmark(
    State(state): State<AppState>,
    request: Option<Json<BenchmarkRequest>>,
) -> ApiResult<Json<BenchmarkResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let samples = request
        .samples
        .unwrap_or(state.container.config.gateway.sample_requests);
    if samples == 0 || samples > MAX_SAMPLES {
        return Err(ApiError::BadRequest(format!(
            "samples must be within 1..={}",
            MAX_SAMPLES
        )));
    }

    tracing::info!(samples, "Provider benchmark requested");
    let reports = state.container.provider_benchmark.run(samples).await;
    Ok(Json(BenchmarkResponse {
        reports,
        ranking: state.container.gateway.ranker().ranking(),
    }))
}

pub fn provider_routes() -> Router<AppState> {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/benchmark", post(run_benchmark))
}
