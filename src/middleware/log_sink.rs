//! Destinations for access log records.
//!
//! - [`TracingSink`]: structured `tracing` event per request (default)
//! - [`JsonLineSink`]: one JSON object per line on any `Write`
//! - [`LineSink`]: template-formatted line on any `Write`
//! - [`RecordingSink`]: keeps records in memory, for tests and embedding apps
//!
//! Every sink must tolerate concurrent `emit` calls from many requests.
//! Writers are wrapped in a `Mutex` held only for the duration of a single
//! write.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::SecondsFormat;
use chrono::format::{Item, StrftimeItems};
use thiserror::Error;
use tracing::{info, warn};

use super::access_log::{LogRecord, Outcome};

/// Default line template, common-log style.
pub const DEFAULT_LINE_FORMAT: &str =
    r#"{client_addr} - - [{start_time}] "{method} {target} {proto}" {status} {size}"#;

/// Error raised by a sink. Never reaches the client.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write access log record: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode access log record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("access log writer lock poisoned")]
    Poisoned,
}

/// Destination for completed-request records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Emits each record as a structured `tracing` event under the
/// `access_log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, r: &LogRecord) -> Result<(), SinkError> {
        if r.outcome == Outcome::Abandoned {
            warn!(
                target: "access_log",
                request = %r.target,
                method = %r.method,
                proto = %r.proto,
                user_agent = %r.user_agent,
                latency_ms = r.latency_ms(),
                client_addr = %r.client_addr,
                remote_addr = %r.remote_addr,
                "request abandoned before a response was produced"
            );
            return Ok(());
        }

        info!(
            target: "access_log",
            request = %r.target,
            method = %r.method,
            proto = %r.proto,
            host = %r.host,
            user_agent = %r.user_agent,
            latency_ms = r.latency_ms(),
            client_addr = %r.client_addr,
            remote_addr = %r.remote_addr,
            status = r.status,
            size = r.size,
            outcome = r.outcome.as_str(),
            "completed handling request"
        );
        Ok(())
    }
}

/// Writes each record as a single JSON line.
#[derive(Debug)]
pub struct JsonLineSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer (e.g. to inspect a buffer).
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl JsonLineSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> LogSink for JsonLineSink<W> {
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        // Encode outside the lock.
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Invalid line template or date format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unknown access log field `{0}`")]
    UnknownField(String),

    #[error("unterminated `{{` at byte {0} in access log format")]
    Unterminated(usize),

    #[error("invalid access log date format `{0}`")]
    InvalidDateFormat(String),
}

/// A field that can appear as `{name}` in a line template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    StartTime,
    Method,
    Target,
    Path,
    Proto,
    Host,
    UserAgent,
    RemoteAddr,
    ClientAddr,
    Status,
    Size,
    LatencyMs,
    Outcome,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "start_time" => Field::StartTime,
            "method" => Field::Method,
            "target" => Field::Target,
            "path" => Field::Path,
            "proto" => Field::Proto,
            "host" => Field::Host,
            "user_agent" => Field::UserAgent,
            "remote_addr" => Field::RemoteAddr,
            "client_addr" => Field::ClientAddr,
            "status" => Field::Status,
            "size" => Field::Size,
            "latency_ms" => Field::LatencyMs,
            "outcome" => Field::Outcome,
            _ => return None,
        };
        Some(field)
    }

    fn render(self, r: &LogRecord, date_format: Option<&str>, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = match self {
            Field::StartTime => match date_format {
                Some(fmt) => write!(out, "{}", r.start_time.format(fmt)),
                None => {
                    out.push_str(&r.start_time.to_rfc3339_opts(SecondsFormat::Secs, true));
                    Ok(())
                }
            },
            Field::Method => write!(out, "{}", r.method),
            Field::Target => write!(out, "{}", r.target),
            Field::Path => write!(out, "{}", r.path()),
            Field::Proto => write!(out, "{}", r.proto),
            Field::Host => write!(out, "{}", r.host),
            Field::UserAgent => write!(out, "{}", r.user_agent),
            Field::RemoteAddr => write!(out, "{}", r.remote_addr),
            Field::ClientAddr => write!(out, "{}", r.client_addr),
            Field::Status => write!(out, "{}", r.status),
            Field::Size => write!(out, "{}", r.size),
            Field::LatencyMs => write!(out, "{:.3}", r.latency_ms()),
            Field::Outcome => write!(out, "{}", r.outcome.as_str()),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Parsed line template such as [`DEFAULT_LINE_FORMAT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFormat {
    segments: Vec<Segment>,
    /// strftime pattern for `{start_time}`; RFC 3339 when unset.
    date_format: Option<String>,
}

impl LineFormat {
    /// Parse a template of literal text and `{field}` placeholders.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for unknown field names or a `{` without a
    /// matching `}`.
    pub fn parse(template: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(open) = rest.find('{') {
            let (literal, after) = rest.split_at(open);
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }

            let close = after
                .find('}')
                .ok_or(FormatError::Unterminated(offset + open))?;
            let name = after.get(1..close).unwrap_or_default();
            let field =
                Field::parse(name).ok_or_else(|| FormatError::UnknownField(name.to_string()))?;
            segments.push(Segment::Field(field));

            offset += open + close + 1;
            rest = after.get(close + 1..).unwrap_or_default();
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            segments,
            date_format: None,
        })
    }

    /// Render `{start_time}` with a chrono strftime pattern such as
    /// `%d/%b/%Y:%H:%M:%S %z` instead of RFC 3339.
    ///
    /// # Errors
    ///
    /// Returns `FormatError::InvalidDateFormat` if chrono cannot parse the
    /// pattern.
    pub fn with_date_format(mut self, date_format: &str) -> Result<Self, FormatError> {
        if StrftimeItems::new(date_format).any(|item| matches!(item, Item::Error)) {
            return Err(FormatError::InvalidDateFormat(date_format.to_string()));
        }
        self.date_format = Some(date_format.to_string());
        Ok(self)
    }

    /// Render a record (without trailing newline).
    pub fn render(&self, record: &LogRecord) -> String {
        let mut out = String::with_capacity(128);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => {
                    field.render(record, self.date_format.as_deref(), &mut out);
                }
            }
        }
        out
    }
}

impl Default for LineFormat {
    fn default() -> Self {
        // DEFAULT_LINE_FORMAT only names known fields.
        Self::parse(DEFAULT_LINE_FORMAT).unwrap_or(Self {
            segments: Vec::new(),
            date_format: None,
        })
    }
}

/// Writes each record as a formatted text line.
#[derive(Debug)]
pub struct LineSink<W> {
    format: LineFormat,
    writer: Mutex<W>,
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(format: LineFormat, writer: W) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl LineSink<io::Stdout> {
    pub fn stdout(format: LineFormat) -> Self {
        Self::new(format, io::stdout())
    }
}

impl<W: Write + Send> LogSink for LineSink<W> {
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let mut line = self.format.render(record);
        line.push('\n');

        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        writer.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far, in emission order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl LogSink for RecordingSink {
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    fn record() -> LogRecord {
        LogRecord {
            start_time: DateTime::parse_from_rfc3339("2026-10-19T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            method: "GET".to_string(),
            target: "/reports?year=2026".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: "example.com".to_string(),
            user_agent: "curl/8.0".to_string(),
            remote_addr: "10.0.0.1:5000".to_string(),
            client_addr: "203.0.113.7".to_string(),
            status: 200,
            size: 42,
            latency: Duration::from_micros(10_500),
            outcome: Outcome::Completed,
        }
    }

    #[test]
    fn test_default_format_renders_common_log_line() {
        let line = LineFormat::default().render(&record());
        assert_eq!(
            line,
            r#"203.0.113.7 - - [2026-10-19T08:30:00Z] "GET /reports?year=2026 HTTP/1.1" 200 42"#
        );
    }

    #[test]
    fn test_default_format_is_valid() {
        assert!(LineFormat::parse(DEFAULT_LINE_FORMAT).is_ok());
    }

    #[test]
    fn test_custom_format_fields() {
        let format = LineFormat::parse("{path} {latency_ms}ms {outcome} ua={user_agent}").unwrap();
        assert_eq!(
            format.render(&record()),
            "/reports 10.500ms completed ua=curl/8.0"
        );
    }

    #[test]
    fn test_format_without_placeholders() {
        let format = LineFormat::parse("static text").unwrap();
        assert_eq!(format.render(&record()), "static text");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert_eq!(
            LineFormat::parse("{client_addr} {cookie}"),
            Err(FormatError::UnknownField("cookie".to_string()))
        );
        assert_eq!(
            LineFormat::parse("{}"),
            Err(FormatError::UnknownField(String::new()))
        );
    }

    #[test]
    fn test_unterminated_placeholder_rejected() {
        assert_eq!(
            LineFormat::parse("{status} {size"),
            Err(FormatError::Unterminated(9))
        );
    }

    #[test]
    fn test_date_format_applies_to_start_time() {
        let format = LineFormat::default()
            .with_date_format("%d/%b/%Y:%H:%M:%S %z")
            .unwrap();
        assert_eq!(
            format.render(&record()),
            r#"203.0.113.7 - - [19/Oct/2026:08:30:00 +0000] "GET /reports?year=2026 HTTP/1.1" 200 42"#
        );
    }

    #[test]
    fn test_invalid_date_format_rejected() {
        assert_eq!(
            LineFormat::default().with_date_format("%Y %!"),
            Err(FormatError::InvalidDateFormat("%Y %!".to_string()))
        );
    }

    #[test]
    fn test_line_sink_writes_lines() {
        let sink = LineSink::new(LineFormat::parse("{method} {status}").unwrap(), Vec::new());
        sink.emit(&record()).unwrap();
        sink.emit(&record()).unwrap();

        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "GET 200\nGET 200\n");
    }

    #[test]
    fn test_json_line_sink_writes_one_object_per_line() {
        let sink = JsonLineSink::new(Vec::new());
        sink.emit(&record()).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert!(output.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(value["client_addr"], "203.0.113.7");
        assert_eq!(value["status"], 200);
        assert_eq!(value["size"], 42);
        assert_eq!(value["latency_ms"], 10.5);
    }

    #[test]
    fn test_broken_writer_surfaces_io_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = LineSink::new(LineFormat::default(), Broken);
        assert!(matches!(sink.emit(&record()), Err(SinkError::Io(_))));
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        let mut second = record();
        second.status = 503;

        sink.emit(&record()).unwrap();
        sink.emit(&second).unwrap();

        let statuses: Vec<u16> = sink.records().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![200, 503]);
        assert_eq!(sink.last().unwrap().status, 503);
    }

    #[test]
    fn test_tracing_sink_never_fails() {
        assert!(TracingSink.emit(&record()).is_ok());
        let mut abandoned = record();
        abandoned.outcome = Outcome::Abandoned;
        assert!(TracingSink.emit(&abandoned).is_ok());
    }
}
