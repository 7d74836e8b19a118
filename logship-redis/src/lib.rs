//! Redis sink for `logship` (companion crate).
//!
//! Three delivery modes over one connection manager:
//! - **list**: `LPUSH <prefix><list> <line>` per record, pipelined, with an
//!   optional TTL refresh on the key;
//! - **stream**: `XADD <prefix><stream> * field value ...` with the record
//!   flattened into field pairs;
//! - **pub/sub**: `PUBLISH <channel> <line>` per record.
//!
//! Connection failures surface as network-class sink errors, so the
//! transport wrapper retries them under the `redis` policy row.

use logship::{
    Batch, LogRecord, RedisMode, RedisSinkConfig, ResourceId, ResourceKind, ResourceRegistry,
    Serializer, Sink, SinkError,
};
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Redis-backed sink.
pub struct RedisSink {
    config: RedisSinkConfig,
    connection: ConnectionManager,
    serializer: Serializer,
    registry: Arc<ResourceRegistry>,
    resource: ResourceId,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSink")
            .field("config", &self.config)
            .field("serializer", &self.serializer)
            .field("resource", &self.resource)
            .field("closed", &self.closed)
            .finish()
    }
}

impl RedisSink {
    pub const NAME: &'static str = "redis";

    /// Connect to the configured server and register the client handle.
    pub async fn connect(
        config: RedisSinkConfig,
        serializer: Serializer,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, SinkError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SinkError::new(format!("invalid redis url '{}': {e}", config.url)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| SinkError::new(format!("redis connection failed: {e}")))?;
        let resource = registry.register(ResourceKind::NetworkClient, config.url.clone());
        tracing::debug!(url = %config.url, "redis sink connected");
        Ok(Self {
            config,
            connection,
            serializer,
            registry,
            resource,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::new("redis sink is closed"));
        }
        let mut pipe = redis::pipe();
        match &self.config.mode {
            RedisMode::List { list } => {
                let key = prefixed_key(&self.config.key_prefix, list);
                for record in batch.records() {
                    let line = line_payload(&self.serializer, record);
                    pipe.cmd("LPUSH").arg(&key).arg(line).ignore();
                }
                if let Some(ttl) = self.config.ttl_seconds {
                    pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                }
            }
            RedisMode::Stream { stream, max_len } => {
                let key = prefixed_key(&self.config.key_prefix, stream);
                for record in batch.records() {
                    let mut cmd = pipe.cmd("XADD");
                    cmd = cmd.arg(&key);
                    if let Some(max_len) = max_len {
                        cmd = cmd.arg("MAXLEN").arg("~").arg(*max_len);
                    }
                    cmd = cmd.arg("*");
                    for (field, value) in stream_fields(&self.serializer, record) {
                        cmd = cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
            }
            RedisMode::Pubsub { channel } => {
                for record in batch.records() {
                    let line = line_payload(&self.serializer, record);
                    pipe.cmd("PUBLISH").arg(channel).arg(line).ignore();
                }
            }
        }
        let mut connection = self.connection.clone();
        pipe.exec_async(&mut connection)
            .await
            .map_err(|e| SinkError::new(format!("redis connection error: {e}")))
    }

    async fn close(&self) -> Result<(), SinkError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.registry.deregister(self.resource);
        }
        Ok(())
    }

    async fn check_health(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut connection = self.connection.clone();
        redis::cmd("PING").query_async::<String>(&mut connection).await.is_ok()
    }
}

fn prefixed_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

/// Serialized record without the trailing newline.
fn line_payload(serializer: &Serializer, record: &LogRecord) -> Vec<u8> {
    let mut line = serializer.serialize(record);
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    line
}

/// Flatten the serialized record into `XADD` field pairs: nested objects use
/// dotted keys, arrays are JSON-encoded, scalars render bare.
fn stream_fields(serializer: &Serializer, record: &LogRecord) -> Vec<(String, String)> {
    let line = line_payload(serializer, record);
    let parsed: Value = match serde_json::from_slice(&line) {
        Ok(value) => value,
        Err(_) => return vec![("raw".to_string(), String::from_utf8_lossy(&line).into_owned())],
    };
    let mut fields = Vec::new();
    flatten_into("", &parsed, &mut fields);
    fields
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let full =
                    if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten_into(&full, child, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Array(_) => out.push((prefix.to_string(), value.to_string())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}
