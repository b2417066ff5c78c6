//! # gatekeep
//!
//! Composable request interceptors for Axum/Tower services:
//!
//! - **Completion logging**: one structured record per request, through a
//!   pluggable sink (tracing, JSON lines, formatted lines)
//! - **Client address resolution**: `X-Forwarded-For`, `X-Real-IP`, then the
//!   peer address, published into a request-scoped store
//! - **Admission control**: reject or delay against an injected decision
//!   source (a Governor-backed limiter is included)
//! - **Deadlines**: fixed 504 on expiry with cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Pipeline scope (RequestContext + root CancellationToken)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Completion Log → Catch Panic → Client Address              │
//! │                 → Admission → Deadline                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Application handler (any Tower service / Axum router)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use axum::{Router, routing::get};
//! use gatekeep::middleware::{AdmissionMode, GovernorLimiter, RequestContext, TracingSink};
//! use gatekeep::Pipeline;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(GovernorLimiter::new(100, 50)?);
//! let pipeline = Pipeline::builder()
//!     .completion_log(Arc::new(TracingSink))
//!     .client_address()
//!     .admission(AdmissionMode::Reject(limiter))
//!     .deadline(Duration::from_secs(30))
//!     .build();
//!
//! let app: Router = Router::new()
//!     .route("/", get(|ctx: RequestContext| async move { ctx.client_addr() }))
//!     .layer(pipeline);
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{Pipeline, PipelineBuilder, Stage};
pub use routes::build_router;
