//! POST /api/classify: one-off classification outside any job

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::models::{PipelineStage, QualityLevel, RawItem, ReferenceTable, ResolutionMethod};
use crate::AppState;

/// Resolved classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedCategory {
    pub code: String,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_table: Option<ReferenceTable>,
}

/// POST /api/classify response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifyResponse {
    /// `None` when nothing could be resolved
    pub category: Option<ResolvedCategory>,
    pub confidence: Option<f64>,
    pub method: ResolutionMethod,
    pub provider_used: Option<String>,
    pub manual_review: bool,
    pub stage_reached: PipelineStage,
    pub quality_level: QualityLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /api/classify
///
/// Malformed items are rejected with 400; nothing is persisted.
pub async fn classify(
    State(state): State<AppState>,
    Json(item): Json<RawItem>,
) -> ApiResult<Json<ClassifyResponse>> {
    let resolution = match state.container.pipeline.classify_item(&item).await {
        Ok(resolution) => resolution,
        Err(e) => {
            let err = ApiError::from(e);
            if matches!(err, ApiError::Internal(_) | ApiError::Common(_)) {
                state.record_error(err.to_string()).await;
            }
            return Err(err);
        }
    };

    tracing::debug!(
        name = %item.name,
        method = %resolution.method,
        confidence = ?resolution.confidence,
        "Ad hoc classification"
    );

    let quality_level = resolution.quality_level();
    let category = resolution.category_code.map(|code| ResolvedCategory {
        code,
        name: resolution.category_name,
        reference_table: resolution.reference_table,
    });

    Ok(Json(ClassifyResponse {
        category,
        confidence: resolution.confidence,
        method: resolution.method,
        provider_used: resolution.provider_used,
        manual_review: resolution.manual_review,
        stage_reached: resolution.stage_reached,
        quality_level,
        error: resolution.error,
    }))
}

pub fn classify_routes() -> Router<AppState> {
    Router::new().route("/api/classify", post(classify))
}
