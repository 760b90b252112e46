//! HTTP API handlers for nsi-ai
//!
//! REST endpoints under `/api`, health check and the SSE event stream.

pub mod classify;
pub mod health;
pub mod ingest;
pub mod jobs;
pub mod monitoring;
pub mod providers;
pub mod quality;
pub mod sse;

pub use classify::classify_routes;
pub use health::health_routes;
pub use ingest::ingest_routes;
pub use jobs::job_routes;
pub use monitoring::monitoring_routes;
pub use providers::provider_routes;
pub use quality::quality_routes;
pub use sse::event_stream;
