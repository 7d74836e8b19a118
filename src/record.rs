//! Log record model: levels, metadata, and the immutable record that flows
//! through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Sentinel stored in place of a field value that could not be serialized.
pub const NON_SERIALIZABLE: &str = "[Non-Serializable]";

/// Log severity levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// OTLP severity number for this level.
    pub fn severity_number(&self) -> u32 {
        match self {
            Level::Debug => 5,
            Level::Info => 9,
            Level::Warn => 13,
            Level::Error => 17,
            Level::Fatal => 21,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(format!("unknown level '{other}'")),
        }
    }
}

/// HTTP request context attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
}

/// Database operation context attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// Security event context attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
}

/// Fixed-shape record metadata. `service` and `environment` must be
/// non-empty; admission validates this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub service: String,
    pub environment: String,
    pub hostname: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityMetadata>,
}

impl Metadata {
    /// Metadata for the current process; hostname read from the environment.
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            request: None,
            database: None,
            security: None,
        }
    }
}

/// Process performance snapshot optionally attached to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_count: Option<u64>,
}

/// A structured log record. Immutable once emitted; after hand-off to the
/// batch manager the emitter must treat it as consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub fields: Map<String, Value>,
    pub metadata: Metadata,
    pub performance: Option<Performance>,
    pub source: String,
    pub version: String,
}

impl LogRecord {
    pub fn builder(level: Level, message: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(level, message)
    }

    /// Admission invariants: non-empty service and environment.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.service.is_empty() {
            return Err("metadata.service must be non-empty".to_string());
        }
        if self.metadata.environment.is_empty() {
            return Err("metadata.environment must be non-empty".to_string());
        }
        Ok(())
    }
}

/// Builder for [`LogRecord`]; generates the id and timestamp at build time.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    level: Level,
    message: String,
    correlation_id: Option<String>,
    request_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    fields: Map<String, Value>,
    metadata: Option<Metadata>,
    performance: Option<Performance>,
    source: String,
    version: String,
}

impl RecordBuilder {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            correlation_id: None,
            request_id: None,
            trace_id: None,
            span_id: None,
            fields: Map::new(),
            metadata: None,
            performance: None,
            source: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    pub fn span_id(mut self, id: impl Into<String>) -> Self {
        self.span_id = Some(id.into());
        self
    }

    /// Attach a structured field. A value that fails JSON conversion is
    /// stored as the `"[Non-Serializable]"` sentinel rather than erroring.
    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|_| Value::String(NON_SERIALIZABLE.to_string()));
        self.fields.insert(key.into(), value);
        self
    }

    pub fn fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn performance(mut self, performance: Performance) -> Self {
        self.performance = Some(performance);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn build(self) -> LogRecord {
        LogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level: self.level,
            message: self.message,
            correlation_id: self.correlation_id,
            request_id: self.request_id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            fields: self.fields,
            metadata: self.metadata.unwrap_or_else(|| Metadata::new("unknown", "unknown")),
            performance: self.performance,
            source: self.source,
            version: self.version,
        }
    }
}

/// An ordered, bounded sequence of records released to a processor in one
/// call. Never mutated after release.
#[derive(Debug)]
pub struct Batch {
    records: Vec<LogRecord>,
    created_at: Instant,
}

impl Batch {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self { records, created_at: Instant::now() }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }
}
