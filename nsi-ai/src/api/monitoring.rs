//! Gateway telemetry

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::gateway::{BatchStats, BreakerSnapshot};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitBreakersResponse {
    /// In ranking order
    pub providers: Vec<BreakerSnapshot>,
    pub all_circuits_open: bool,
}

/// GET /api/monitoring/circuit-breakers
pub async fn circuit_breakers(State(state): State<AppState>) -> Json<CircuitBreakersResponse> {
    let gateway = &state.container.gateway;
    Json(CircuitBreakersResponse {
        providers: gateway.breaker_snapshots(),
        all_circuits_open: gateway.all_circuits_open(),
    })
}

/// GET /api/monitoring/batch
pub async fn batch_stats(State(state): State<AppState>) -> Json<BatchStats> {
    Json(state.container.batch_processor.stats())
}

pub fn monitoring_routes() -> Router<AppState> {
    Router::new()
        .route("/api/monitoring/circuit-breakers", get(circuit_breakers))
        .route("/api/monitoring/batch", get(batch_stats))
}
