//! OTLP/HTTP log sink for `logship`.
//!
//! Batches convert to the OTLP `ExportLogsServiceRequest` JSON shape (the
//! outermost object is exactly that shape, with no extra envelope) and POST
//! to the configured endpoint. Bodies above the compression threshold are
//! gzipped. HTTP status codes map onto retryability hints the classifier
//! and policy table honor.

use logship::{
    compress, Batch, LogRecord, OtlpSinkConfig, ResourceId, ResourceKind, ResourceRegistry,
    Sink, SinkError,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SCOPE_NAME: &str = "logship-otlp";
const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// OTLP log sink over HTTP.
#[derive(Debug)]
pub struct OtlpSink {
    config: OtlpSinkConfig,
    client: reqwest::Client,
    registry: Arc<ResourceRegistry>,
    resource: ResourceId,
    closed: AtomicBool,
}

impl OtlpSink {
    pub const NAME: &'static str = "otlp";

    pub fn new(
        config: OtlpSinkConfig,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, SinkError> {
        if config.endpoint.is_empty() {
            return Err(SinkError::new("invalid otlp endpoint: empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SinkError::new(format!("invalid http client config: {e}")))?;
        let resource = registry.register(ResourceKind::NetworkClient, config.endpoint.clone());
        Ok(Self { config, client, registry, resource, closed: AtomicBool::new(false) })
    }
}

#[async_trait::async_trait]
impl Sink for OtlpSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::new("otlp sink is closed"));
        }
        let body = build_export_request(batch);
        let serialized = serde_json::to_vec(&body)
            .map_err(|e| SinkError::new(format!("serialize otlp payload: {e}")))?;
        let (payload, compressed) =
            encode_body(serialized, self.config.compression_threshold)?;

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.config.user_agent)
            .body(payload);
        if compressed {
            request = request.header("Content-Encoding", "gzip");
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::timeout(self.config.timeout())
            } else {
                SinkError::new(format!("network error: {e}"))
            }
        })?;
        let status = response.status().as_u16();
        match classify_status(status) {
            StatusClass::Success => {
                tracing::debug!(
                    endpoint = %self.config.endpoint,
                    status,
                    records = batch.len(),
                    compressed,
                    "otlp export accepted"
                );
                Ok(())
            }
            StatusClass::Failure { retryable } => {
                let detail = response.text().await.unwrap_or_default();
                Err(SinkError::http(status, format!("otlp export failed ({status}): {detail}"))
                    .with_retryable(retryable))
            }
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.registry.deregister(self.resource);
        }
        Ok(())
    }

    async fn check_health(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// Outcome class for one HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Failure { retryable: bool },
}

/// 2xx succeeds; 408 and 429 are the only retryable 4xx; 5xx retries;
/// unexpected 1xx/3xx do not.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Failure { retryable: true },
        400..=499 => StatusClass::Failure { retryable: false },
        500..=599 => StatusClass::Failure { retryable: true },
        _ => StatusClass::Failure { retryable: false },
    }
}

/// Gzip the body when it is strictly larger than the threshold.
pub fn encode_body(body: Vec<u8>, threshold: usize) -> Result<(Vec<u8>, bool), SinkError> {
    if body.len() > threshold {
        let compressed = compress(&body)
            .map_err(|e| SinkError::new(format!("gzip of otlp payload failed: {e}")))?;
        Ok((compressed, true))
    } else {
        Ok((body, false))
    }
}

/// Build the `ExportLogsServiceRequest` JSON for one batch. The batch is
/// self-describing: resource attributes duplicate the service identity.
pub fn build_export_request(batch: &Batch) -> Value {
    let (service, environment) = batch
        .records()
        .first()
        .map(|r| (r.metadata.service.clone(), r.metadata.environment.clone()))
        .unwrap_or_default();
    let log_records: Vec<Value> = batch.records().iter().map(to_log_record).collect();
    json!({
        "resourceLogs": [{
            "resource": {
                "attributes": [
                    attribute("service.name", Value::String(service)),
                    attribute("service.environment", Value::String(environment)),
                ]
            },
            "scopeLogs": [{
                "scope": { "name": SCOPE_NAME, "version": SCOPE_VERSION },
                "logRecords": log_records
            }]
        }]
    })
}

/// Convert one record to an OTLP logRecord value.
pub fn to_log_record(record: &LogRecord) -> Value {
    let nanos = record
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| record.timestamp.timestamp_micros().saturating_mul(1_000));
    let mut attributes = Vec::new();
    push_scalar(&mut attributes, "log.id", Value::String(record.id.clone()));
    push_scalar(&mut attributes, "log.source", Value::String(record.source.clone()));
    push_scalar(&mut attributes, "log.version", Value::String(record.version.clone()));
    if let Some(id) = &record.correlation_id {
        push_scalar(&mut attributes, "correlation.id", Value::String(id.clone()));
    }
    if let Some(id) = &record.request_id {
        push_scalar(&mut attributes, "request.id", Value::String(id.clone()));
    }
    if let Some(id) = &record.trace_id {
        push_scalar(&mut attributes, "trace.id", Value::String(id.clone()));
    }
    if let Some(id) = &record.span_id {
        push_scalar(&mut attributes, "span.id", Value::String(id.clone()));
    }
    push_scalar(
        &mut attributes,
        "service.name",
        Value::String(record.metadata.service.clone()),
    );
    push_scalar(
        &mut attributes,
        "service.environment",
        Value::String(record.metadata.environment.clone()),
    );
    push_scalar(
        &mut attributes,
        "host.name",
        Value::String(record.metadata.hostname.clone()),
    );
    push_scalar(&mut attributes, "process.pid", Value::from(record.metadata.pid));

    if let Some(request) = &record.metadata.request {
        push_optional(&mut attributes, "http.method", request.method.as_ref());
        push_optional(&mut attributes, "http.path", request.path.as_ref());
        if let Some(status) = request.status_code {
            push_scalar(&mut attributes, "http.status_code", Value::from(status));
        }
        if let Some(duration) = request.duration_ms {
            push_scalar(&mut attributes, "http.duration_ms", Value::from(duration));
        }
        push_optional(&mut attributes, "http.user_agent", request.user_agent.as_ref());
        push_optional(&mut attributes, "http.client_ip", request.remote_ip.as_ref());
    }
    if let Some(db) = &record.metadata.database {
        push_optional(&mut attributes, "db.operation", db.operation.as_ref());
        push_optional(&mut attributes, "db.table", db.table.as_ref());
        if let Some(duration) = db.duration_ms {
            push_scalar(&mut attributes, "db.duration_ms", Value::from(duration));
        }
        if let Some(rows) = db.rows_affected {
            push_scalar(&mut attributes, "db.rows_affected", Value::from(rows));
        }
    }
    if let Some(security) = &record.metadata.security {
        push_optional(&mut attributes, "security.event", security.event.as_ref());
        push_optional(&mut attributes, "security.severity", security.severity.as_ref());
        push_optional(&mut attributes, "security.actor", security.actor.as_ref());
        push_optional(&mut attributes, "security.ip", security.remote_ip.as_ref());
    }
    if let Some(perf) = &record.performance {
        if let Some(cpu) = perf.cpu_usage {
            push_scalar(&mut attributes, "performance.cpu_usage", Value::from(cpu));
        }
        if let Some(memory) = perf.memory_usage {
            push_scalar(&mut attributes, "performance.memory_usage", Value::from(memory));
        }
        if let Some(duration) = perf.duration {
            push_scalar(&mut attributes, "performance.duration_ms", Value::from(duration));
        }
        if let Some(count) = perf.operation_count {
            push_scalar(&mut attributes, "performance.operation_count", Value::from(count));
        }
    }
    flatten_fields(&mut attributes, "", &record.fields);

    json!({
        "timeUnixNano": nanos.to_string(),
        "observedTimeUnixNano": nanos.to_string(),
        "severityNumber": record.level.severity_number(),
        "severityText": record.level.as_str().to_uppercase(),
        "body": { "stringValue": record.message },
        "attributes": attributes,
    })
}

fn attribute(key: &str, value: Value) -> Value {
    json!({ "key": key, "value": any_value(&value) })
}

fn push_scalar(attributes: &mut Vec<Value>, key: &str, value: Value) {
    attributes.push(attribute(key, value));
}

fn push_optional(attributes: &mut Vec<Value>, key: &str, value: Option<&String>) {
    if let Some(value) = value {
        push_scalar(attributes, key, Value::String(value.clone()));
    }
}

/// Nested objects flatten into dotted keys; arrays are JSON-serialized;
/// scalars keep their type.
fn flatten_fields(attributes: &mut Vec<Value>, prefix: &str, fields: &Map<String, Value>) {
    for (key, value) in fields {
        let full_key =
            if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        match value {
            Value::Object(nested) => flatten_fields(attributes, &full_key, nested),
            other => push_scalar(attributes, &full_key, other.clone()),
        }
    }
}

/// OTLP `AnyValue` JSON shape, type-preserving.
fn any_value(value: &Value) -> Value {
    match value {
        Value::String(s) => json!({ "stringValue": s }),
        Value::Bool(b) => json!({ "boolValue": b }),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                json!({ "intValue": n })
            } else {
                json!({ "doubleValue": n })
            }
        }
        Value::Array(_) => json!({ "stringValue": value.to_string() }),
        Value::Null => json!({ "stringValue": "null" }),
        Value::Object(_) => json!({ "stringValue": value.to_string() }),
    }
}
