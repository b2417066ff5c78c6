//! Application routing with the interceptor pipeline.
//!
//! # Pipeline (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Completion Log  │ ← one record per request
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Catch Panic    │ ← 500 on handler panic
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Client Address  │ ← X-Forwarded-For / X-Real-IP / peer
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Admission     │ ← 503 if not admitted
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Deadline     │ ← 504 if expired
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::handlers;
use crate::pipeline::Pipeline;

/// Build the application router with every route behind the pipeline.
///
/// Cancelling `shutdown` signals every in-flight request.
///
/// # Errors
///
/// Returns an error if the pipeline configuration is invalid.
pub fn build_router(config: &Config, shutdown: CancellationToken) -> AppResult<Router> {
    let pipeline = Pipeline::from_config(config, Some(shutdown))?;
    info!(stages = ?pipeline.stage_names(), "Interceptor pipeline configured");

    Ok(Router::new()
        .route("/health", get(handlers::health_check))
        .route("/whoami", get(handlers::whoami))
        .route("/slow", get(handlers::slow))
        .layer(pipeline))
}
