//! nsi-ai library interface
//!
//! Catalog and counterparty normalization: deterministic reference and benchmark
//! matching first, AI classification through a resilient multi-provider gateway
//! second, with checkpointed batch jobs and quality reporting on top.

pub mod api;
pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod gateway;
pub mod matchers;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod quality;
pub mod repository;
pub mod similarity;

pub use crate::container::{ContainerBuilder, ServiceContainer};
pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use nsi_common::events::EventBus;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub container: Arc<ServiceContainer>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(container: Arc<ServiceContainer>) -> Self {
        Self {
            event_bus: container.event_bus.clone(),
            container,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember an error for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::classify_routes())
        .merge(api::job_routes())
        .merge(api::monitoring_routes())
        .merge(api::provider_routes())
        .merge(api::quality_routes())
        .merge(api::ingest_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
