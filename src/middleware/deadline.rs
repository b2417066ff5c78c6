//! Deadline enforcement with a fixed 504 response.
//!
//! Each request moves through a two-state machine exactly once:
//!
//! ```text
//!            handler returns first
//! Running ───────────────────────────▶ Completed   (handler's response, untouched)
//!    │
//!    └─────────────────────────────────▶ Expired     (504, empty body)
//!            deadline elapses first
//! ```
//!
//! On entry the request's cancellation token is replaced by a child token
//! for the rest of the chain. On expiry the child is cancelled and the
//! handler future is dropped; work the handler spawned is only *signaled*,
//! never preempted, so handlers must observe
//! [`RequestCancellation`](super::context::RequestCancellation) at safe
//! points for cancellation to reach it.
//!
//! Cancellation coming from the parent (client disconnect, shutdown) also
//! reaches the child, but is not reported as a timeout: the handler decides
//! what to answer in that case.
//!
//! The response is a single value produced by exactly one branch, so the
//! 504 can never overwrite a status the handler already produced.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::context::{ensure_cancellation, replace_cancellation};
use crate::metrics;

/// Minimum accepted deadline (1ms).
pub const MIN_DEADLINE_MS: u64 = 1;

/// Maximum accepted deadline (5 minutes).
pub const MAX_DEADLINE_MS: u64 = 300_000;

/// Terminal state of one request under a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// The handler produced the response.
    Completed,
    /// The deadline fired first; the response is the fixed 504.
    Expired,
}

/// Marker placed in the extensions of responses produced by expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExpired;

/// Deadline layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/report", get(build_report))
///     .layer(DeadlineLayer::new(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeadlineLayer {
    timeout: Duration,
}

impl DeadlineLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Build from milliseconds.
    ///
    /// Returns `None` if the value is outside
    /// [`MIN_DEADLINE_MS`]..=[`MAX_DEADLINE_MS`].
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_DEADLINE_MS..=MAX_DEADLINE_MS).contains(&ms) {
            return None;
        }
        Some(Self::new(Duration::from_millis(ms)))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            timeout: self.timeout,
        }
    }
}

/// Deadline enforcing service wrapper.
#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Request<Body>> for DeadlineService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let timeout = self.timeout;

        let parent = ensure_cancellation(&mut req);
        let child = parent.child_token();
        replace_cancellation(&mut req, child.clone());
        let path = req.uri().path().to_owned();

        Box::pin(async move {
            // Released on every exit path, unwinding included.
            let _scope = child.clone().drop_guard();

            let (outcome, result) = tokio::select! {
                biased;
                result = inner.call(req) => (DeadlineOutcome::Completed, result),
                _ = tokio::time::sleep(timeout) => {
                    child.cancel();
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
                    response.extensions_mut().insert(DeadlineExpired);
                    (DeadlineOutcome::Expired, Ok(response))
                }
            };

            match outcome {
                DeadlineOutcome::Completed => {
                    debug!(
                        path = %path,
                        parent_cancelled = parent.is_cancelled(),
                        "Handler finished within deadline"
                    );
                }
                DeadlineOutcome::Expired => {
                    warn!(
                        path = %path,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Request deadline expired"
                    );
                    metrics::record_deadline_expired();
                }
            }

            result
        })
    }
}
