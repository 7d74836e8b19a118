//! Canonical JSON-line serialization of log records.
//!
//! Serialization is total: no input record can make it fail or panic. When
//! the primary pathway errors the output degrades to a minimal envelope
//! carrying an `@error` key. Configured field-name patterns are masked at
//! any depth before encoding.

use crate::error::ConfigError;
use crate::record::{Batch, LogRecord};
use chrono::SecondsFormat;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde_json::{Map, Value};
use std::io::{self, Write};

/// Sentinel rendered for value graphs nested past the depth bound.
pub const CIRCULAR_REFERENCE: &str = "[Circular Reference]";

/// Fixed-width replacement for masked values when length preservation is off.
pub const MASK_SENTINEL: &str = "******";

/// Payloads larger than this are compressed off the async runtime.
pub const STREAM_THRESHOLD: usize = 1024 * 1024;

const MAX_DEPTH: usize = 64;
const COMPRESS_CHUNK: usize = 64 * 1024;

/// Field-name masking configuration.
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    patterns: Vec<Regex>,
    preserve_length: bool,
    masking_char: char,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self { patterns: Vec::new(), preserve_length: false, masking_char: '*' }
    }
}

impl MaskingConfig {
    pub fn new(
        patterns: &[String],
        preserve_length: bool,
        masking_char: char,
    ) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, preserve_length, masking_char })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(key))
    }

    fn masked(&self, value: &Value) -> Value {
        if self.preserve_length {
            if let Value::String(s) = value {
                let width = s.chars().count();
                return Value::String(self.masking_char.to_string().repeat(width));
            }
        }
        Value::String(MASK_SENTINEL.to_string())
    }
}

/// Converts records to newline-terminated canonical JSON.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    masking: MaskingConfig,
}

impl Serializer {
    pub fn new(masking: MaskingConfig) -> Self {
        Self { masking }
    }

    /// Serialize one record. Top-level keys appear in a fixed order; the
    /// output is always valid JSON ending in `\n`.
    pub fn serialize(&self, record: &LogRecord) -> Vec<u8> {
        match self.try_serialize(record) {
            Ok(bytes) => bytes,
            Err(err) => self.fallback_envelope(record, &err.to_string()),
        }
    }

    /// Serialize a batch; a record that degrades to its fallback envelope
    /// never affects its siblings.
    pub fn serialize_batch(&self, batch: &Batch) -> Vec<Vec<u8>> {
        batch.records().iter().map(|r| self.serialize(r)).collect()
    }

    fn try_serialize(&self, record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
        let mut top = Map::new();
        top.insert(
            "@timestamp".to_string(),
            Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        top.insert("@id".to_string(), Value::String(record.id.clone()));
        top.insert("level".to_string(), Value::String(record.level.as_str().to_string()));
        top.insert("message".to_string(), Value::String(record.message.clone()));
        if let Some(id) = &record.correlation_id {
            top.insert("correlationId".to_string(), Value::String(id.clone()));
        }
        if let Some(id) = &record.request_id {
            top.insert("requestId".to_string(), Value::String(id.clone()));
        }
        if let Some(id) = &record.trace_id {
            top.insert("traceId".to_string(), Value::String(id.clone()));
        }
        if let Some(id) = &record.span_id {
            top.insert("spanId".to_string(), Value::String(id.clone()));
        }
        top.insert("source".to_string(), Value::String(record.source.clone()));
        top.insert("version".to_string(), Value::String(record.version.clone()));

        let mut fields = Value::Object(record.fields.clone());
        self.sanitize(&mut fields, 0);
        top.insert("fields".to_string(), fields);

        let mut metadata = serde_json::to_value(&record.metadata)?;
        self.sanitize(&mut metadata, 0);
        top.insert("metadata".to_string(), metadata);

        if let Some(perf) = &record.performance {
            top.insert("performance".to_string(), serde_json::to_value(perf)?);
        }

        let mut bytes = serde_json::to_vec(&Value::Object(top))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Minimal envelope emitted when the primary pathway fails.
    fn fallback_envelope(&self, record: &LogRecord, reason: &str) -> Vec<u8> {
        let mut top = Map::new();
        top.insert(
            "@timestamp".to_string(),
            Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        top.insert("@id".to_string(), Value::String(record.id.clone()));
        top.insert("level".to_string(), Value::String(record.level.as_str().to_string()));
        top.insert("message".to_string(), Value::String(record.message.clone()));
        top.insert("@error".to_string(), Value::String(reason.to_string()));
        let mut bytes = serde_json::to_vec(&Value::Object(top)).unwrap_or_else(|_| {
            // All five values are plain strings; this cannot fail, but the
            // serializer must not panic regardless.
            format!("{{\"@error\":\"{reason}\"}}").into_bytes()
        });
        bytes.push(b'\n');
        bytes
    }

    /// Mask matching keys and cut off pathological nesting.
    fn sanitize(&self, value: &mut Value, depth: usize) {
        if depth > MAX_DEPTH {
            *value = Value::String(CIRCULAR_REFERENCE.to_string());
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.masking.matches(key) {
                        *child = self.masking.masked(child);
                    } else {
                        self.sanitize(child, depth + 1);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.sanitize(item, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Gzip-compress a payload synchronously.
pub fn compress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Gzip-compress a payload, moving work above [`STREAM_THRESHOLD`] onto the
/// blocking pool with chunked writes so large bodies never stall the runtime.
pub async fn compress_large(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    if bytes.len() <= STREAM_THRESHOLD {
        return compress(&bytes);
    }
    tokio::task::spawn_blocking(move || {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for chunk in bytes.chunks(COMPRESS_CHUNK) {
            encoder.write_all(chunk)?;
        }
        encoder.finish()
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, LogRecord, Metadata, Performance};
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn record() -> LogRecord {
        LogRecord::builder(Level::Info, "hello")
            .metadata(Metadata::new("svc", "test"))
            .correlation_id("corr-7")
            .field("user", "alice")
            .field("password", "hunter2")
            .build()
    }

    fn parse(bytes: &[u8]) -> Value {
        assert_eq!(bytes.last(), Some(&b'\n'));
        serde_json::from_slice(&bytes[..bytes.len() - 1]).expect("valid json line")
    }

    #[test]
    fn output_is_valid_json_with_fixed_key_order() {
        let serializer = Serializer::default();
        let parsed = parse(&serializer.serialize(&record()));
        let keys: Vec<_> = parsed.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "@timestamp",
                "@id",
                "level",
                "message",
                "correlationId",
                "source",
                "version",
                "fields",
                "metadata"
            ]
        );
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["message"], "hello");
        assert_eq!(parsed["fields"]["user"], "alice");
    }

    #[test]
    fn masking_replaces_matching_keys_at_depth() {
        let masking =
            MaskingConfig::new(&["(?i)password".to_string(), "token".to_string()], false, '*')
                .unwrap();
        let serializer = Serializer::new(masking);
        let mut rec = record();
        rec.fields.insert("nested".to_string(), json!({"apiToken": "abc", "ok": 1}));
        let parsed = parse(&serializer.serialize(&rec));
        assert_eq!(parsed["fields"]["password"], MASK_SENTINEL);
        assert_eq!(parsed["fields"]["nested"]["apiToken"], MASK_SENTINEL);
        assert_eq!(parsed["fields"]["nested"]["ok"], 1);
        assert_eq!(parsed["fields"]["user"], "alice");
    }

    #[test]
    fn masking_can_preserve_length() {
        let masking = MaskingConfig::new(&["password".to_string()], true, '#').unwrap();
        let serializer = Serializer::new(masking);
        let parsed = parse(&serializer.serialize(&record()));
        assert_eq!(parsed["fields"]["password"], "#######");
    }

    #[test]
    fn invalid_masking_pattern_is_a_config_error() {
        let err = MaskingConfig::new(&["(unclosed".to_string()], false, '*').unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn deep_nesting_renders_circular_sentinel() {
        let mut value = json!("leaf");
        for _ in 0..200 {
            value = json!({ "next": value });
        }
        let mut rec = record();
        rec.fields.insert("deep".to_string(), value);
        let serializer = Serializer::default();
        let parsed = parse(&serializer.serialize(&rec));
        let rendered = serde_json::to_string(&parsed["fields"]["deep"]).unwrap();
        assert!(rendered.contains(CIRCULAR_REFERENCE));
    }

    #[test]
    fn batch_serialization_is_element_independent() {
        let serializer = Serializer::default();
        let batch = Batch::new(vec![record(), record(), record()]);
        let lines = serializer.serialize_batch(&batch);
        assert_eq!(lines.len(), 3);
        for line in &lines {
            parse(line);
        }
    }

    #[test]
    fn serialization_round_trips_under_fixed_ordering() {
        let serializer = Serializer::default();
        let rec = record();
        let first = serializer.serialize(&rec);
        let reparsed: Value = serde_json::from_slice(&first[..first.len() - 1]).unwrap();
        let mut again = serde_json::to_vec(&reparsed).unwrap();
        again.push(b'\n');
        assert_eq!(first, again);
    }

    #[test]
    fn performance_block_serializes_camel_case() {
        let serializer = Serializer::default();
        let mut rec = record();
        rec.performance = Some(Performance {
            cpu_usage: Some(0.5),
            memory_usage: Some(1024),
            duration: Some(12.5),
            operation_count: Some(3),
        });
        let parsed = parse(&serializer.serialize(&rec));
        assert_eq!(parsed["performance"]["cpuUsage"], 0.5);
        assert_eq!(parsed["performance"]["memoryUsage"], 1024);
        assert_eq!(parsed["performance"]["operationCount"], 3);
    }

    #[test]
    fn compress_round_trips() {
        let payload = b"logship compression payload".repeat(100);
        let compressed = compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn compress_large_handles_both_paths() {
        let small = vec![7u8; 128];
        let small_out = compress_large(small.clone()).await.unwrap();
        let mut decoder = GzDecoder::new(&small_out[..]);
        let mut round = Vec::new();
        decoder.read_to_end(&mut round).unwrap();
        assert_eq!(round, small);

        let big = vec![42u8; STREAM_THRESHOLD + 1];
        let big_out = compress_large(big.clone()).await.unwrap();
        let mut decoder = GzDecoder::new(&big_out[..]);
        let mut round = Vec::new();
        decoder.read_to_end(&mut round).unwrap();
        assert_eq!(round, big);
    }
}
