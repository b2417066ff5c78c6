//! Ordered composition of interceptors around a terminal handler.
//!
//! A [`Pipeline`] is a list of [`Stage`]s fixed at construction. The first
//! stage is the outermost: it sees the request first and the response last.
//! Around all stages the pipeline establishes the request scope:
//!
//! - a fresh [`RequestContext`] store in the request extensions
//! - a root [`RequestCancellation`] token, a child of the server-wide
//!   shutdown token when one is configured
//!
//! The root token is cancelled when the scope ends on any path (response
//! returned, panic unwind, or the connection dropping the request future),
//! so work spawned by handlers always sees the end of its request.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = Pipeline::builder()
//!     .completion_log(Arc::new(TracingSink))
//!     .catch_panic()
//!     .client_address()
//!     .admission(AdmissionMode::Reject(limiter))
//!     .deadline(Duration::from_secs(30))
//!     .build();
//!
//! let app = Router::new().route("/", get(handler)).layer(pipeline);
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::config::{AccessLogKind, AdmissionKind, Config};
use crate::error::AppResult;
use crate::middleware::access_log::AccessLogLayer;
use crate::middleware::admission::{AdmissionLayer, AdmissionMode};
use crate::middleware::context::{RequestCancellation, RequestContext, replace_cancellation};
use crate::middleware::deadline::DeadlineLayer;
use crate::middleware::ip::ClientAddrLayer;
use crate::middleware::log_sink::{JsonLineSink, LineSink, LogSink, TracingSink};
use crate::middleware::rate_limit::GovernorLimiter;

/// Type-erased service every stage wraps and produces.
pub type Handler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

type CustomLayer = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// One interceptor in a pipeline.
#[derive(Clone)]
pub enum Stage {
    /// Emit one [`LogRecord`](crate::middleware::LogRecord) per request.
    CompletionLog(Arc<dyn LogSink>),
    /// Turn a handler panic into a 500 response.
    CatchPanic,
    /// Resolve and publish the client address.
    ClientAddress,
    /// Gate the rest of the chain on a decision source.
    Admission(AdmissionMode),
    /// Bound the rest of the chain by a deadline.
    Deadline(Duration),
    /// Any other Tower layer.
    Custom(CustomLayer),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CompletionLog(_) => "completion_log",
            Stage::CatchPanic => "catch_panic",
            Stage::ClientAddress => "client_address",
            Stage::Admission(_) => "admission",
            Stage::Deadline(_) => "deadline",
            Stage::Custom(_) => "custom",
        }
    }

    fn apply(&self, inner: Handler) -> Handler {
        match self {
            Stage::CompletionLog(sink) => Handler::new(AccessLogLayer::new(sink.clone()).layer(inner)),
            Stage::CatchPanic => Handler::new(
                CatchPanicLayer::new()
                    .layer(inner)
                    .map_response(|response| response.map(Body::new)),
            ),
            Stage::ClientAddress => Handler::new(ClientAddrLayer::new().layer(inner)),
            Stage::Admission(mode) => Handler::new(AdmissionLayer::new(mode.clone()).layer(inner)),
            Stage::Deadline(timeout) => Handler::new(DeadlineLayer::new(*timeout).layer(inner)),
            Stage::Custom(wrap) => wrap(inner),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Admission(mode) => f.debug_tuple("Admission").field(mode).finish(),
            Stage::Deadline(timeout) => f.debug_tuple("Deadline").field(timeout).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Builder for [`Pipeline`]. Stages are kept in call order.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    shutdown: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn completion_log(self, sink: Arc<dyn LogSink>) -> Self {
        self.stage(Stage::CompletionLog(sink))
    }

    pub fn catch_panic(self) -> Self {
        self.stage(Stage::CatchPanic)
    }

    pub fn client_address(self) -> Self {
        self.stage(Stage::ClientAddress)
    }

    pub fn admission(self, mode: AdmissionMode) -> Self {
        self.stage(Stage::Admission(mode))
    }

    pub fn deadline(self, timeout: Duration) -> Self {
        self.stage(Stage::Deadline(timeout))
    }

    /// Insert an arbitrary Tower layer at this position.
    pub fn layer<L>(self, layer: L) -> Self
    where
        L: Layer<Handler> + Send + Sync + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send + 'static,
    {
        self.stage(Stage::Custom(Arc::new(move |inner| {
            Handler::new(layer.layer(inner))
        })))
    }

    /// Parent every request's root token on `token`, so cancelling it
    /// signals all in-flight requests.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: Arc::from(self.stages),
            shutdown: self.shutdown,
        }
    }
}

/// An immutable, cheaply cloneable chain of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Arc<[Stage]>,
    shutdown: Option<CancellationToken>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// The standard chain described by `config`:
    /// completion log, catch panic, client address, admission, deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the line format or the rate limit is invalid.
    pub fn from_config(config: &Config, shutdown: Option<CancellationToken>) -> AppResult<Self> {
        let sink: Arc<dyn LogSink> = match config.access_log {
            AccessLogKind::Tracing => Arc::new(TracingSink),
            AccessLogKind::Json => Arc::new(JsonLineSink::stdout()),
            AccessLogKind::Line => Arc::new(LineSink::stdout(config.line_format()?)),
        };

        let mut builder = Self::builder().completion_log(sink);
        if config.catch_panics {
            builder = builder.catch_panic();
        }
        builder = builder.client_address();

        if config.admission_mode != AdmissionKind::Off {
            let limiter = Arc::new(GovernorLimiter::new(
                config.rate_limit_rps,
                config.rate_limit_burst,
            )?);
            info!(
                mode = %config.admission_mode,
                rps = limiter.rps(),
                burst = limiter.burst(),
                "Admission control enabled"
            );
            builder = builder.admission(match config.admission_mode {
                AdmissionKind::Delay => AdmissionMode::Delay(limiter),
                _ => AdmissionMode::Reject(limiter),
            });
        }

        if let Some(timeout) = config.request_deadline() {
            info!(timeout_ms = config.request_deadline_ms, "Request deadline enabled");
            builder = builder.deadline(timeout);
        }

        if let Some(token) = shutdown {
            builder = builder.shutdown_token(token);
        }

        Ok(builder.build())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Compose all stages around `handler`.
    pub fn wrap<S>(&self, handler: S) -> Handler
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let chain = self
            .stages
            .iter()
            .rev()
            .fold(Handler::new(handler), |inner, stage| stage.apply(inner));

        Handler::new(ScopeService {
            inner: chain,
            shutdown: self.shutdown.clone(),
        })
    }
}

impl<S> Layer<S> for Pipeline
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = Handler;

    fn layer(&self, inner: S) -> Self::Service {
        self.wrap(inner)
    }
}

/// Establishes the request scope around the whole chain.
#[derive(Clone)]
struct ScopeService {
    inner: Handler,
    shutdown: Option<CancellationToken>,
}

impl Service<Request<Body>> for ScopeService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        RequestContext::ensure(&mut req);

        // Nested pipelines inherit the outer scope's token.
        let root = match req.extensions().get::<RequestCancellation>() {
            Some(outer) => outer.token().child_token(),
            None => self
                .shutdown
                .as_ref()
                .map(CancellationToken::child_token)
                .unwrap_or_default(),
        };
        replace_cancellation(&mut req, root.clone());

        Box::pin(async move {
            let _scope = root.drop_guard();
            inner.call(req).await
        })
    }
}
