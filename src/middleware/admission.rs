//! Admission control in front of the handler chain.
//!
//! The decision itself is delegated to an injected capability; this layer
//! only enforces it. Two modes exist, selected by which capability is given:
//!
//! | Mode       | Capability  | Denied / failed                          |
//! |------------|-------------|------------------------------------------|
//! | Rejecting  | [`Allower`] | 503, body `rate limit exceeded`          |
//! | Delaying   | [`Waiter`]  | 503, body is the wait error's message    |
//!
//! In both modes a rejection is terminal: the inner service is never called
//! and nothing is retried here.
//!
//! The delaying wait is raced against the request's cancellation token, so
//! an upstream deadline, a client disconnect or server shutdown unblocks a
//! queued request even if the capability itself ignores the token.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::context::{RequestContext, ensure_cancellation};
use crate::metrics;

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The non-blocking decision source said no.
    #[error("rate limit exceeded")]
    Limited,

    /// The request was cancelled while waiting for permission.
    #[error("request cancelled while waiting for admission")]
    Cancelled,

    /// The decision source failed or refused with its own reason.
    #[error("{0}")]
    Unavailable(String),
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> axum::response::Response {
        let mut response = plain_text_error(StatusCode::SERVICE_UNAVAILABLE, &self.to_string());
        response.extensions_mut().insert(AdmissionRejected);
        response
    }
}

/// Marker placed in the extensions of responses produced by a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRejected;

/// Plain-text error response: `text/plain`, `nosniff`, trailing newline.
pub fn plain_text_error(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{message}\n")));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// Non-blocking decision source.
pub trait Allower: Send + Sync {
    /// Whether a request may proceed right now.
    fn allow(&self) -> bool;
}

/// Future returned by [`Waiter::wait`].
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AdmissionError>> + Send + 'a>>;

/// Blocking decision source.
pub trait Waiter: Send + Sync {
    /// Resolve once the request may proceed, or with an error.
    ///
    /// Implementations should return promptly once `cancel` fires.
    fn wait<'a>(&'a self, cancel: &'a CancellationToken) -> WaitFuture<'a>;
}

/// Adapter turning a closure into an [`Allower`].
#[derive(Debug, Clone, Copy)]
pub struct AllowerFn<F>(pub F);

impl<F> Allower for AllowerFn<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn allow(&self) -> bool {
        (self.0)()
    }
}

/// Adapter turning an async closure into a [`Waiter`].
///
/// The closure receives a clone of the request's cancellation token.
#[derive(Debug, Clone, Copy)]
pub struct WaiterFn<F>(pub F);

impl<F, Fut> Waiter for WaiterFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AdmissionError>> + Send + 'static,
{
    fn wait<'a>(&'a self, cancel: &'a CancellationToken) -> WaitFuture<'a> {
        Box::pin((self.0)(cancel.clone()))
    }
}

/// Which capability gates the chain.
#[derive(Clone)]
pub enum AdmissionMode {
    Reject(Arc<dyn Allower>),
    Delay(Arc<dyn Waiter>),
}

impl AdmissionMode {
    pub fn name(&self) -> &'static str {
        match self {
            AdmissionMode::Reject(_) => "reject",
            AdmissionMode::Delay(_) => "delay",
        }
    }
}

impl std::fmt::Debug for AdmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AdmissionMode").field(&self.name()).finish()
    }
}

/// Admission control layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(GovernorLimiter::new(100, 50)?);
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(AdmissionLayer::rejecting(limiter));
/// ```
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    mode: AdmissionMode,
}

impl AdmissionLayer {
    pub fn new(mode: AdmissionMode) -> Self {
        Self { mode }
    }

    /// Reject immediately when `allower` denies.
    pub fn rejecting(allower: Arc<dyn Allower>) -> Self {
        Self::new(AdmissionMode::Reject(allower))
    }

    /// Hold each request until `waiter` grants permission.
    pub fn delaying(waiter: Arc<dyn Waiter>) -> Self {
        Self::new(AdmissionMode::Delay(waiter))
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            mode: self.mode.clone(),
        }
    }
}

/// Admission control service wrapper.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    mode: AdmissionMode,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
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
        let mode = self.mode.clone();

        match mode {
            AdmissionMode::Reject(allower) => {
                if allower.allow() {
                    return Box::pin(async move { inner.call(req).await });
                }
                let response = reject(&req, "reject", AdmissionError::Limited);
                Box::pin(async move { Ok(response) })
            }
            AdmissionMode::Delay(waiter) => {
                let cancel = ensure_cancellation(&mut req);

                Box::pin(async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
                        waited = waiter.wait(&cancel) => waited,
                    };

                    match outcome {
                        Ok(()) => {
                            debug!(path = %req.uri().path(), "Admission granted after wait");
                            inner.call(req).await
                        }
                        Err(e) => Ok(reject(&req, "delay", e)),
                    }
                })
            }
        }
    }
}

/// Build the terminal rejection response and record it.
fn reject<B>(req: &Request<B>, mode: &'static str, error: AdmissionError) -> Response<Body> {
    let client_addr = req
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.client_addr())
        .unwrap_or_default();

    warn!(
        client_addr = %client_addr,
        path = %req.uri().path(),
        mode,
        reason = %error,
        "Request not admitted"
    );
    metrics::record_admission_rejection(mode);

    error.into_response()
}
