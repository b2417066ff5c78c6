//! Endpoints that show what the pipeline hands to application code.
//!
//! - `GET /whoami` - the client address published by the resolver
//! - `GET /slow?ms=N` - sleeps `N` ms, stopping early when the request is
//!   cancelled (deadline, disconnect, shutdown)

use std::time::Duration;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::middleware::admission::plain_text_error;
use crate::middleware::context::{RequestCancellation, RequestContext};

/// Answer with the resolved client address (empty when unknown).
pub async fn whoami(ctx: RequestContext) -> String {
    ctx.client_addr()
}

#[derive(Debug, Deserialize)]
pub struct SlowParams {
    #[serde(default)]
    pub ms: u64,
}

/// Sleep for the requested time, honoring cancellation.
pub async fn slow(cancel: RequestCancellation, Query(params): Query<SlowParams>) -> Response {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(ms = params.ms, "Slow request cancelled");
            plain_text_error(StatusCode::SERVICE_UNAVAILABLE, "request cancelled")
        }
        _ = tokio::time::sleep(Duration::from_millis(params.ms)) => {
            format!("slept {}ms\n", params.ms).into_response()
        }
    }
}
