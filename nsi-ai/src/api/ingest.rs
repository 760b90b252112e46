//! Importer endpoints: source records, reference entries, benchmarks
//!
//! Reference and benchmark writes invalidate the matcher caches so new entries are
//! used by the next lookup instead of after `reference_ttl_secs`.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::models::{NewBenchmark, NewSourceRecord, ReferenceEntry};
use crate::AppState;

/// Largest payload accepted in one call
const MAX_ROWS_PER_REQUEST: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertedResponse {
    pub ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertedResponse {
    pub upserted: u64,
}

fn check_size(len: usize) -> ApiResult<()> {
    if len == 0 {
        return Err(ApiError::BadRequest("empty payload".to_string()));
    }
    if len > MAX_ROWS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "at most {} rows per request, got {}",
            MAX_ROWS_PER_REQUEST, len
        )));
    }
    Ok(())
}

/// POST /api/records
///
/// Rows are stored as submitted; malformed names surface later as input errors of
/// the job that processes them.
pub async fn insert_records(
    State(state): State<AppState>,
    Json(records): Json<Vec<NewSourceRecord>>,
) -> ApiResult<(StatusCode, Json<InsertedResponse>)> {
    check_size(records.len())?;
    if let Some(bad) = records.iter().find(|r| r.source_table.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "source_table is required (record '{}')",
            bad.raw_name
        )));
    }

    let ids = state
        .container
        .repositories
        .records
        .insert_source_records(&records)
        .await?;
    tracing::info!(count = ids.len(), "Source records imported");
    Ok((StatusCode::CREATED, Json(InsertedResponse { ids })))
}

/// POST /api/references
pub async fn upsert_references(
    State(state): State<AppState>,
    Json(entries): Json<Vec<ReferenceEntry>>,
) -> ApiResult<Json<UpsertedResponse>> {
    check_size(entries.len())?;
    if let Some(bad) = entries
        .iter()
        .find(|e| e.code.trim().is_empty() || e.name.trim().is_empty())
    {
        return Err(ApiError::BadRequest(format!(
            "reference entries need a code and a name ({} '{}')",
            bad.table, bad.code
        )));
    }

    let upserted = state
        .container
        .repositories
        .references
        .upsert_reference_entries(&entries)
        .await?;
    state.container.invalidate_caches();
    tracing::info!(upserted, "Reference entries imported");
    Ok(Json(UpsertedResponse { upserted }))
}

/// POST /api/benchmarks
pub async fn upsert_benchmarks(
    State(state): State<AppState>,
    Json(benchmarks): Json<Vec<NewBenchmark>>,
) -> ApiResult<(StatusCode, Json<InsertedResponse>)> {
    check_size(benchmarks.len())?;
    if let Some(bad) = benchmarks
        .iter()
        .find(|b| b.name.trim().is_empty() || b.code.trim().is_empty())
    {
        return Err(ApiError::BadRequest(format!(
            "benchmarks need a name and a code ('{}')",
            bad.name
        )));
    }

    let ids = state
        .container
        .repositories
        .benchmarks
        .upsert_benchmarks(&benchmarks)
        .await?;
    state.container.invalidate_caches();
    tracing::info!(count = ids.len(), "Benchmarks imported");
    Ok((StatusCode::CREATED, Json(InsertedResponse { ids })))
}

pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/api/records", post(insert_records))
        .route("/api/references", post(upsert_references))
        .route("/api/benchmarks", post(upsert_benchmarks))
}
