//! Request interceptors for Axum/Tower services.
//!
//! Each interceptor is an ordinary Tower [`Layer`](tower::Layer) and can be
//! used on its own. [`Pipeline`](crate::pipeline::Pipeline) composes them in
//! the standard order:
//!
//! ```text
//! Request → Completion Log → Catch Panic → Client Address → Admission → Deadline → Handler
//!                ↓                ↓                              ↓            ↓
//!           one record       500 on panic                   503 limited   504 expired
//! ```
//!
//! - **Completion log** ([`access_log`]): one record per request through a
//!   pluggable [`LogSink`](log_sink::LogSink)
//! - **Client address** ([`ip`]): forwarding headers, then the peer address
//! - **Admission** ([`admission`], [`rate_limit`]): reject or delay against
//!   an injected decision source
//! - **Deadline** ([`deadline`]): per-request timeout with cancellation
//!
//! Interceptors share per-request values through [`context`], never through
//! globals.

pub mod access_log;
pub mod admission;
pub mod context;
pub mod deadline;
pub mod ip;
pub mod log_sink;
pub mod rate_limit;

pub use access_log::{AccessLogLayer, LogRecord, Outcome};
pub use admission::{
    AdmissionError, AdmissionLayer, AdmissionMode, Allower, AllowerFn, Waiter, WaiterFn,
};
pub use context::{ClientAddr, RequestCancellation, RequestContext, RequestScopeExt};
pub use deadline::{DeadlineLayer, MAX_DEADLINE_MS, MIN_DEADLINE_MS};
pub use ip::{ClientAddrLayer, UNKNOWN_ADDR, resolve_client_addr};
pub use log_sink::{
    DEFAULT_LINE_FORMAT, FormatError, JsonLineSink, LineFormat, LineSink, LogSink, RecordingSink,
    SinkError, TracingSink,
};
pub use rate_limit::{GovernorLimiter, RateLimitError};
