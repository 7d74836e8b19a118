//! Error types for the delivery pipeline.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a concrete sink.
///
/// Sinks reduce their native failures (I/O, HTTP, client library errors) to
/// this shape; the classifier works from the message, the optional status
/// code, and the optional retryability hint.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SinkError {
    message: String,
    status: Option<u16>,
    retryable: Option<bool>,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, retryable: None }
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::new(format!("i/o error: {err}"))
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { message: message.into(), status: Some(status), retryable: None }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(format!("operation timed out after {elapsed:?}"))
    }

    /// Attach an explicit retryability hint, overriding message-based
    /// classification.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn retryable_hint(&self) -> Option<bool> {
        self.retryable
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::io(&err)
    }
}

/// Errors surfaced by the pipeline and its components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline (or a component of it) has been closed.
    #[error("pipeline is closed")]
    Closed,

    /// The batch queue is at capacity; the record was rejected.
    #[error("queue full ({pending} pending, max {max})")]
    QueueFull { pending: usize, max: usize },

    /// The circuit breaker for this sink is open.
    #[error("circuit open for sink '{sink}' after {failures} consecutive failures")]
    CircuitOpen { sink: String, failures: usize },

    /// A record failed its invariants at admission.
    #[error("invalid record: {0}")]
    Validation(String),

    /// All attempts against one sink failed; carries the final sink error.
    #[error("delivery to '{sink}' failed after {attempts} attempt(s): {source}")]
    Delivery {
        sink: String,
        attempts: usize,
        #[source]
        source: SinkError,
    },

    /// Every sink in the failover chain failed; the batch was dropped.
    #[error("failover exhausted after {chain_len} sink(s): {source}")]
    FailoverExhausted {
        chain_len: usize,
        #[source]
        source: SinkError,
    },

    /// Construction-time configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Borrow the terminal sink error, if this failure carries one.
    pub fn sink_error(&self) -> Option<&SinkError> {
        match self {
            Self::Delivery { source, .. } | Self::FailoverExhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Configuration errors; fatal at construction, surfaced synchronously.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("no enabled transports configured")]
    NoTransports,

    #[error("fallback chain references unknown sink '{0}'")]
    UnknownSink(String),

    #[error("invalid masking pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_error_carries_status_and_hint() {
        let err = SinkError::http(503, "service unavailable").with_retryable(true);
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.retryable_hint(), Some(true));
        assert_eq!(err.to_string(), "service unavailable");
    }

    #[test]
    fn sink_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SinkError::from(io);
        assert!(err.message().contains("denied"));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn pipeline_error_predicates() {
        assert!(PipelineError::Closed.is_closed());
        assert!(PipelineError::QueueFull { pending: 10, max: 10 }.is_queue_full());
        let open = PipelineError::CircuitOpen { sink: "otlp".into(), failures: 5 };
        assert!(open.is_circuit_open());
        assert!(!open.is_queue_full());
    }

    #[test]
    fn delivery_error_exposes_sink_error() {
        let err = PipelineError::Delivery {
            sink: "file".into(),
            attempts: 3,
            source: SinkError::new("disk full"),
        };
        assert_eq!(err.sink_error().unwrap().message(), "disk full");
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn queue_full_display_names_the_cap() {
        let err = PipelineError::QueueFull { pending: 11, max: 10 };
        assert_eq!(err.to_string(), "queue full (11 pending, max 10)");
    }
}
