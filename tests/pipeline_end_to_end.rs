#![allow(missing_docs)]

mod common;

use common::test_helpers::{record, ScriptedSink};
use logship::{
    Level, LogRecord, Metadata, Pipeline, PipelineConfig, PipelineError, Sink, SinkError,
    TransportConfig, TransportKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn base_config(batch_size: usize, timeout_ms: u64) -> PipelineConfig {
    serde_json::from_value(json!({
        "level": "debug",
        "transports": [
            { "name": "scripted", "type": "console" },
        ],
        "batch": {
            "maxSize": batch_size,
            "timeoutMs": timeout_ms,
            "maxConcurrency": 2,
            "maxQueueSize": 100
        },
        "fallback": { "enable": true, "chain": ["console"], "maxDepth": 3, "timeoutMs": 1000 }
    }))
    .expect("valid config")
}

#[tokio::test]
async fn records_flow_to_the_primary_sink_in_order() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    let pipeline = Pipeline::builder(base_config(3, 10_000)).sink(sink.clone()).build().unwrap();

    pipeline.log(record(Level::Info, "A")).unwrap();
    pipeline.log(record(Level::Warn, "B")).unwrap();
    pipeline.log(record(Level::Error, "C")).unwrap();
    pipeline.flush().await.unwrap();

    assert_eq!(sink.delivered(), vec![vec!["A", "B", "C"]]);
    let stats = pipeline.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.fallback_used, 0);
}

#[tokio::test]
async fn level_gate_drops_quiet_records() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    let mut config = base_config(10, 10_000);
    config.level = Level::Warn;
    let pipeline = Pipeline::builder(config).sink(sink.clone()).build().unwrap();

    pipeline.log(record(Level::Debug, "quiet")).unwrap();
    pipeline.log(record(Level::Info, "quiet too")).unwrap();
    pipeline.log(record(Level::Error, "loud")).unwrap();
    pipeline.flush().await.unwrap();

    assert_eq!(sink.delivered(), vec![vec!["loud"]]);
}

#[tokio::test]
async fn batch_timeout_flushes_partial_batches() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    let pipeline = Pipeline::builder(base_config(100, 50)).sink(sink.clone()).build().unwrap();

    pipeline.log(record(Level::Info, "lonely")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(sink.delivered(), vec![vec!["lonely"]]);
    assert_eq!(pipeline.pending_count(), 0);
}

#[tokio::test]
async fn primary_failure_falls_back_to_console() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    // Default table: unknown sink name gets 3 attempts.
    sink.fail_times(3, SinkError::new("ECONNREFUSED").with_retryable(true));
    let mut config = base_config(1, 10_000);
    config.retry.insert(
        "scripted".to_string(),
        serde_json::from_value(json!({
            "maxAttempts": 3, "initialDelayMs": 1, "maxDelayMs": 5, "multiplier": 1.0, "jitterMs": 0
        }))
        .unwrap(),
    );
    let pipeline = Pipeline::builder(config).sink(sink.clone()).build().unwrap();

    pipeline.log(record(Level::Info, "fall back")).unwrap();
    pipeline.flush().await.unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.delivered, 1, "console fallback counts as delivered");
    assert_eq!(stats.fallback_used, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(sink.calls(), 3, "primary exhausted its attempts first");
}

#[tokio::test]
async fn close_drains_and_rejects_further_records() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    let pipeline = Pipeline::builder(base_config(100, 10_000)).sink(sink.clone()).build().unwrap();

    pipeline.log(record(Level::Info, "last words")).unwrap();
    pipeline.close().await.unwrap();
    pipeline.close().await.unwrap();

    assert_eq!(sink.delivered(), vec![vec!["last words"]]);
    assert_eq!(sink.closes(), 1);
    let err = pipeline.log(record(Level::Info, "too late")).unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn build_rejects_unknown_transport_names() {
    let config: PipelineConfig = serde_json::from_value(json!({
        "transports": [{ "name": "ghost", "type": "console" }]
    }))
    .unwrap();
    // No sink named "ghost" is registered; only the implicit console exists.
    let err = Pipeline::builder(config).build().unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn build_rejects_empty_transports() {
    let err = Pipeline::builder(PipelineConfig::default()).build().unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn masked_fields_never_reach_a_sink() {
    struct CapturingSink {
        inner: ScriptedSink,
        serialized: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Sink for CapturingSink {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn send(&self, batch: &logship::Batch) -> Result<(), SinkError> {
            // Sinks serialize through the pipeline's serializer contract;
            // emulate that here to observe masking.
            let serializer = logship::Serializer::new(
                logship::MaskingConfig::new(&["password".to_string()], false, '*').unwrap(),
            );
            {
                let mut lines = self.serialized.lock().unwrap();
                for bytes in serializer.serialize_batch(batch) {
                    lines.push(String::from_utf8(bytes).unwrap());
                }
            }
            self.inner.send(batch).await
        }
    }

    let sink = Arc::new(CapturingSink {
        inner: ScriptedSink::new("scripted"),
        serialized: std::sync::Mutex::new(Vec::new()),
    });
    let pipeline = Pipeline::builder(base_config(1, 10_000)).sink(sink.clone()).build().unwrap();

    let record = LogRecord::builder(Level::Info, "login")
        .metadata(Metadata::new("svc", "test"))
        .field("password", "hunter2")
        .build();
    pipeline.log(record).unwrap();
    pipeline.flush().await.unwrap();

    let lines = sink.serialized.lock().unwrap().clone();
    assert_eq!(lines.len(), 1);
    assert!(!lines[0].contains("hunter2"));
    assert!(lines[0].contains("******"));
}

#[tokio::test]
async fn overflow_surfaces_queue_full_to_the_emitter() {
    let sink = Arc::new(ScriptedSink::new("scripted"));
    sink.set_send_delay(Duration::from_millis(500));
    let config: PipelineConfig = serde_json::from_value(json!({
        "transports": [{ "name": "scripted", "type": "console" }],
        "batch": { "maxSize": 1, "timeoutMs": 60000, "maxConcurrency": 1, "maxQueueSize": 5 }
    }))
    .unwrap();
    let pipeline = Pipeline::builder(config).sink(sink.clone()).build().unwrap();

    for i in 0..5 {
        pipeline.log(record(Level::Info, &format!("m{i}"))).unwrap();
    }
    let err = pipeline.log(record(Level::Info, "overflow")).unwrap_err();
    assert!(err.is_queue_full());
    assert!(!pipeline.is_healthy());

    pipeline.flush().await.unwrap();
    assert!(pipeline.is_healthy(), "clean flush clears the overflow mark");
    pipeline.log(record(Level::Info, "recovered")).unwrap();
    pipeline.flush().await.unwrap();
}

#[test]
fn transport_kind_round_trips_from_config_json() {
    let config: PipelineConfig = serde_json::from_value(json!({
        "transports": [
            { "name": "console", "type": "console" },
            { "name": "audit", "type": "file", "path": "/tmp/audit.log" }
        ]
    }))
    .unwrap();
    let kinds: Vec<_> = config
        .transports
        .iter()
        .map(|t: &TransportConfig| match &t.kind {
            TransportKind::Console => "console",
            TransportKind::File(_) => "file",
            TransportKind::Otlp(_) => "otlp",
            TransportKind::Redis(_) => "redis",
        })
        .collect();
    assert_eq!(kinds, vec!["console", "file"]);
}
