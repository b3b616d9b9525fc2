//! Structured logging port.
//!
//! Every instrumented primitive writes its events through a [`Logger`]. Events
//! are ordinary [`tracing`] events whose message is the event name
//! (`connectStart`, `readDone`, ...) and whose fields carry the observable
//! payload. Lifecycle events are emitted at `INFO`, per-I/O events at `DEBUG`.
//!
//! The library never installs a subscriber; without one, events are dropped.

use std::error::Error as StdError;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::Span;

use crate::spanid::SpanId;

/// Destination for the events of one pipeline run.
///
/// A logger wraps a [`tracing::Span`] which becomes the explicit parent of
/// every event, so events of concurrent runs can be told apart by span.
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Log under `span`.
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Log under the span which is current when this is called.
    pub fn current() -> Self {
        Self::new(Span::current())
    }

    /// Log root events, outside of any span.
    pub fn root() -> Self {
        Self::new(Span::none())
    }

    /// Derive a logger whose events carry `spanID`.
    pub fn with_span_id(&self, id: &SpanId) -> Self {
        Self::new(tracing::info_span!(parent: &self.span, "netops", spanID = %id))
    }

    /// The parent span of this logger's events.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::current()
    }
}

/// RFC 3339 timestamp with nanosecond precision.
pub(crate) fn timestamp(t: SystemTime) -> String {
    humantime::format_rfc3339_nanos(t).to_string()
}

/// The `deadline` field: a timestamp, or empty when there is no deadline.
pub(crate) fn deadline(deadline: Option<SystemTime>) -> String {
    deadline.map(timestamp).unwrap_or_default()
}

/// The `err` field: the error message, or empty on success.
pub(crate) fn error_message(err: Option<&(dyn StdError + 'static)>) -> String {
    err.map(|err| err.to_string()).unwrap_or_default()
}

/// Raw bytes as standard base64.
pub(crate) fn bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}
