//! Completion logging: one record per request, whatever happened to it.
//!
//! [`AccessLogLayer`] should wrap everything else so the record reflects the
//! final response: a 503 from admission, a 504 from the deadline, a 500
//! from panic recovery, or the handler's own answer.
//!
//! # Exit Paths
//!
//! | Exit path                         | Record                                   |
//! |-----------------------------------|------------------------------------------|
//! | Response body sent to the end     | status and bytes actually sent           |
//! | Response body never polled        | status and declared size (hint or        |
//! |                                   | `Content-Length`)                        |
//! | Response body dropped mid-stream  | outcome `abandoned`, bytes sent so far   |
//! | Inner service returned an error   | outcome `abandoned`, fallback status 200 |
//! | Panic unwinding through the layer | outcome `abandoned`, fallback status 200 |
//! | Request future dropped (client    | outcome `abandoned`, fallback status 200 |
//! | disconnect, shutdown)             |                                          |
//!
//! The record is emitted once the response body is done, so latency covers
//! sending the body as well.
//!
//! Sink failures, including a panicking sink, are swallowed: logging must
//! never change what the client sees.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes, HttpBody};
use axum::http::header::{CONTENT_LENGTH, HOST, HeaderName, USER_AGENT};
use axum::http::{Request, Response, StatusCode};
use chrono::{DateTime, Utc};
use http_body::{Frame, SizeHint};
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::debug;

use super::admission::AdmissionRejected;
use super::context::RequestContext;
use super::deadline::DeadlineExpired;
use super::ip::peer_addr;
use super::log_sink::LogSink;
use crate::metrics;

/// Status recorded when no response ever materialized.
pub const FALLBACK_STATUS: StatusCode = StatusCode::OK;

/// How the request ended, as seen from the outermost scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The handler (or a recovery layer) produced the response.
    Completed,
    /// Admission control turned the request away.
    Rejected,
    /// The deadline fired before the handler finished.
    TimedOut,
    /// No response was produced: inner error, panic, or dropped future.
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Rejected => "rejected",
            Outcome::TimedOut => "timed_out",
            Outcome::Abandoned => "abandoned",
        }
    }

    fn of(response: &Response<Body>) -> Self {
        if response.extensions().get::<DeadlineExpired>().is_some() {
            Outcome::TimedOut
        } else if response.extensions().get::<AdmissionRejected>().is_some() {
            Outcome::Rejected
        } else {
            Outcome::Completed
        }
    }
}

/// Immutable snapshot of one finished request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub start_time: DateTime<Utc>,
    pub method: String,
    /// Request target as received (path and query).
    pub target: String,
    pub proto: String,
    pub host: String,
    pub user_agent: String,
    /// Transport peer (`ip:port`), empty when unknown.
    pub remote_addr: String,
    /// Address published by the client address resolver, empty when unknown.
    pub client_addr: String,
    pub status: u16,
    pub size: u64,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub outcome: Outcome,
}

impl LogRecord {
    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn latency_ms(&self) -> f64 {
        millis(self.latency)
    }
}

fn serialize_millis<S>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(millis(*latency))
}

/// Milliseconds with microsecond precision.
fn millis(latency: Duration) -> f64 {
    latency.as_micros() as f64 / 1000.0
}

/// The request half of a record, captured before the inner call.
struct RequestSummary {
    start_time: DateTime<Utc>,
    started: Instant,
    method: String,
    target: String,
    proto: String,
    host: String,
    user_agent: String,
    remote_addr: String,
}

impl RequestSummary {
    fn capture<B>(req: &Request<B>) -> Self {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            method: req.method().to_string(),
            target: req.uri().to_string(),
            proto: format!("{:?}", req.version()),
            host: header(HOST)
                .or_else(|| req.uri().authority().map(|a| a.to_string()))
                .unwrap_or_default(),
            user_agent: header(USER_AGENT).unwrap_or_default(),
            remote_addr: peer_addr(req),
        }
    }

    fn into_record(
        self,
        ctx: &RequestContext,
        status: u16,
        size: u64,
        outcome: Outcome,
    ) -> LogRecord {
        LogRecord {
            latency: self.started.elapsed(),
            start_time: self.start_time,
            method: self.method,
            target: self.target,
            proto: self.proto,
            host: self.host,
            user_agent: self.user_agent,
            remote_addr: self.remote_addr,
            client_addr: ctx.client_addr(),
            status,
            size,
            outcome,
        }
    }
}

/// Emits exactly one record: the first `emit` wins, and dropping an
/// unfinished record logs it as abandoned.
struct PendingRecord {
    summary: Option<RequestSummary>,
    ctx: RequestContext,
    sink: Arc<dyn LogSink>,
}

impl PendingRecord {
    fn begin<B>(req: &Request<B>, ctx: RequestContext, sink: Arc<dyn LogSink>) -> Self {
        Self {
            summary: Some(RequestSummary::capture(req)),
            ctx,
            sink,
        }
    }

    fn emit(&mut self, status: u16, size: u64, outcome: Outcome) {
        if let Some(summary) = self.summary.take() {
            let record = summary.into_record(&self.ctx, status, size, outcome);
            deliver(self.sink.as_ref(), &record);
        }
    }

    /// Hand the record over to the response body, which emits it once the
    /// body has been sent.
    fn attach(self, response: Response<Body>) -> Response<Body> {
        let status = response.status().as_u16();
        let outcome = Outcome::of(&response);
        let declared = body_size(&response);

        response.map(|inner| {
            Body::new(CountingBody {
                inner,
                pending: self,
                status,
                outcome,
                declared,
                sent: 0,
                polled: false,
            })
        })
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        self.emit(FALLBACK_STATUS.as_u16(), 0, Outcome::Abandoned);
    }
}

/// Response body that counts the bytes actually sent.
///
/// The record is emitted at end of stream. A body dropped before it was
/// ever polled is logged with its declared size; one dropped part way
/// through (client gone) is logged as abandoned with the bytes sent so far.
struct CountingBody {
    inner: Body,
    pending: PendingRecord,
    status: u16,
    outcome: Outcome,
    declared: u64,
    sent: u64,
    polled: bool,
}

impl CountingBody {
    fn complete(&mut self) {
        self.pending.emit(self.status, self.sent, self.outcome);
    }
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        this.polled = true;

        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.sent += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
            }
            Poll::Ready(Some(Err(_))) => {
                this.pending.emit(this.status, this.sent, Outcome::Abandoned);
            }
            Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        if !self.polled {
            self.pending.emit(self.status, self.declared, self.outcome);
        } else if self.inner.is_end_stream() {
            self.complete();
        } else {
            self.pending.emit(self.status, self.sent, Outcome::Abandoned);
        }
    }
}

fn body_size(response: &Response<Body>) -> u64 {
    response.body().size_hint().exact().unwrap_or_else(|| {
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    })
}

/// Hand a record to the sink; never fails, never panics.
fn deliver(sink: &dyn LogSink, record: &LogRecord) {
    metrics::record_request_duration(
        &record.method,
        record.status,
        record.latency.as_secs_f64(),
    );

    match panic::catch_unwind(AssertUnwindSafe(|| sink.emit(record))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics::record_access_log_failure();
            debug!(error = %e, "Access log sink failed, record dropped");
        }
        Err(_) => {
            metrics::record_access_log_failure();
            debug!("Access log sink panicked, record dropped");
        }
    }
}

/// Completion logging layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(ClientAddrLayer::new())
///     .layer(AccessLogLayer::new(Arc::new(TracingSink)));
/// ```
#[derive(Clone)]
pub struct AccessLogLayer {
    sink: Arc<dyn LogSink>,
}

impl AccessLogLayer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl std::fmt::Debug for AccessLogLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            sink: self.sink.clone(),
        }
    }
}

/// Completion logging service wrapper.
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    sink: Arc<dyn LogSink>,
}

impl<S> Service<Request<Body>> for AccessLogService<S>
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

        let ctx = RequestContext::ensure(&mut req);
        let pending = PendingRecord::begin(&req, ctx, self.sink.clone());

        Box::pin(async move {
            // An error or unwind here drops `pending`, logging it as abandoned.
            let response = inner.call(req).await?;
            Ok(pending.attach(response))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::ConnectInfo;
    use tower::ServiceExt;

    use crate::middleware::context::ClientAddr;
    use crate::middleware::log_sink::{RecordingSink, SinkError};

    struct FailingSink(AtomicUsize);

    impl LogSink for FailingSink {
        fn emit(&self, _record: &LogRecord) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Poisoned)
        }
    }

    struct PanickingSink;

    impl LogSink for PanickingSink {
        fn emit(&self, _record: &LogRecord) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    fn ok_handler(
        body: &'static str,
    ) -> tower::util::BoxCloneSyncService<Request<Body>, Response<Body>, Infallible> {
        tower::util::BoxCloneSyncService::new(tower::service_fn(move |req: Request<Body>| async move {
            // Stand-in for an inner resolver publishing the address.
            if let Some(ctx) = req.extensions().get::<RequestContext>() {
                ctx.publish(ClientAddr("198.51.100.23".to_string()));
            }
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }))
    }

    #[tokio::test]
    async fn test_record_captures_request_and_response() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(ok_handler("hello"));

        let mut req = Request::builder()
            .method("POST")
            .uri("/items?page=2")
            .header("host", "api.example.com")
            .header("user-agent", "curl/8.0")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("10.0.0.9:40000".parse::<SocketAddr>().unwrap()));

        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.method, "POST");
        assert_eq!(record.target, "/items?page=2");
        assert_eq!(record.path(), "/items");
        assert_eq!(record.proto, "HTTP/1.1");
        assert_eq!(record.host, "api.example.com");
        assert_eq!(record.user_agent, "curl/8.0");
        assert_eq!(record.remote_addr, "10.0.0.9:40000");
        assert_eq!(record.client_addr, "198.51.100.23");
        assert_eq!(record.status, 200);
        assert_eq!(record.size, 5);
        assert_eq!(record.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_missing_fields_default_to_empty() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(tower::service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::empty())) },
        ));

        svc.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let record = sink.last().unwrap();
        assert_eq!(record.client_addr, "");
        assert_eq!(record.remote_addr, "");
        assert_eq!(record.user_agent, "");
        assert_eq!(record.size, 0);
    }

    #[tokio::test]
    async fn test_outcome_from_response_markers() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(tower::service_fn(
            |_req: Request<Body>| async {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
                response.extensions_mut().insert(DeadlineExpired);
                Ok::<_, Infallible>(response)
            },
        ));

        svc.oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        let record = sink.last().unwrap();
        assert_eq!(record.status, 504);
        assert_eq!(record.outcome, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn test_inner_error_logs_abandoned() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(tower::service_fn(
            |_req: Request<Body>| async { Err::<Response<Body>, _>("backend went away") },
        ));

        let result = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await;
        assert!(result.is_err());

        let record = sink.last().unwrap();
        assert_eq!(record.outcome, Outcome::Abandoned);
        assert_eq!(record.status, FALLBACK_STATUS.as_u16());
    }

    #[tokio::test]
    async fn test_dropped_future_logs_abandoned() {
        let sink = RecordingSink::new();
        let mut svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(tower::service_fn(
            |_req: Request<Body>| std::future::pending::<Result<Response<Body>, Infallible>>(),
        ));

        let future = svc.call(Request::builder().body(Body::empty()).unwrap());
        assert!(sink.records().is_empty());
        drop(future);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Abandoned);
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let sink = Arc::new(FailingSink(AtomicUsize::new(0)));
        let svc = AccessLogLayer::new(sink.clone()).layer(ok_handler("fine"));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        drop(response);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_sink_is_swallowed() {
        let svc = AccessLogLayer::new(Arc::new(PanickingSink)).layer(ok_handler("fine"));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Body yielding fixed chunks without a size hint, like a streamed file.
    struct ChunkedBody(std::collections::VecDeque<Bytes>);

    impl HttpBody for ChunkedBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.0.pop_front().map(|chunk| Ok(Frame::data(chunk))))
        }
    }

    fn streaming_handler(
        chunks: Vec<&'static str>,
    ) -> tower::util::BoxCloneSyncService<Request<Body>, Response<Body>, Infallible> {
        tower::util::BoxCloneSyncService::new(tower::service_fn(move |_req: Request<Body>| {
            let chunks = chunks.iter().map(|c| Bytes::from_static(c.as_bytes()));
            let body = ChunkedBody(chunks.collect());
            async move { Ok::<_, Infallible>(Response::new(Body::new(body))) }
        }))
    }

    #[tokio::test]
    async fn test_streaming_body_logs_bytes_sent() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(streaming_handler(vec![
            "twenty-one bytes each",
            "twenty-one bytes each",
        ]));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.body().size_hint().exact().is_none());
        assert!(sink.records().is_empty());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 42);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, 42);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_body_dropped_mid_stream_logs_abandoned() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone()))
            .layer(streaming_handler(vec!["first chunk", "second chunk"]));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        let frame = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap().len(), 11);
        drop(body);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, 11);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].outcome, Outcome::Abandoned);
    }

    #[tokio::test]
    async fn test_unread_body_logs_declared_size() {
        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(ok_handler("hello"));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        drop(response);

        let record = sink.last().unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_handler_panic_logs_abandoned() {
        async fn explode(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
            panic!("handler exploded");
        }

        let sink = RecordingSink::new();
        let svc = AccessLogLayer::new(Arc::new(sink.clone())).layer(tower::service_fn(explode));

        let req = Request::builder().uri("/boom").body(Body::empty()).unwrap();
        let joined = tokio::spawn(svc.oneshot(req)).await;
        assert!(joined.unwrap_err().is_panic());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "/boom");
        assert_eq!(records[0].status, FALLBACK_STATUS.as_u16());
        assert_eq!(records[0].outcome, Outcome::Abandoned);
    }

    #[test]
    fn test_body_size_prefers_exact_hint() {
        let response = Response::builder()
            .header(CONTENT_LENGTH, "1234")
            .body(Body::from("abc"))
            .unwrap();
        assert_eq!(body_size(&response), 3);
    }

    #[test]
    fn test_record_serializes_latency_ms() {
        let record = LogRecord {
            start_time: DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            method: "GET".to_string(),
            target: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: String::new(),
            user_agent: String::new(),
            remote_addr: String::new(),
            client_addr: "203.0.113.7".to_string(),
            status: 200,
            size: 2,
            latency: Duration::from_millis(12),
            outcome: Outcome::Completed,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["latency_ms"], 12.0);
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["client_addr"], "203.0.113.7");
    }
}
