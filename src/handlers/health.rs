//! Liveness endpoint.

use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint. Always 200 while the process serves requests.
///
/// ```json
/// { "status": "healthy", "version": "0.1.0", "timestamp": "2026-01-15T10:30:00Z" }
/// ```
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}
