#![allow(missing_docs)]

mod common;

use common::test_helpers::{record, ScriptedSink};
use logship::{
    Batch, CircuitBreaker, ErrorHandler, ErrorRateLimiter, FailoverConfig, FailoverDispatcher,
    HealthConfig, HealthMonitor, Level, PipelineError, RetryPolicy, SinkError, SinkPolicy,
    TrackingSleeper, TransportWrapper,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn batch(messages: &[&str]) -> Batch {
    Batch::new(messages.iter().map(|m| record(Level::Info, m)).collect())
}

fn quick_policy(max_attempts: usize) -> SinkPolicy {
    SinkPolicy::new(RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(10),
        2.0,
        Duration::ZERO,
    ))
}

struct Fixture {
    sinks: HashMap<String, Arc<ScriptedSink>>,
    monitor: Arc<HealthMonitor>,
    dispatcher: FailoverDispatcher,
}

fn fixture(names: &[&str], chain: Vec<String>, health: HealthConfig) -> Fixture {
    let monitor = Arc::new(HealthMonitor::new(health));
    let mut sinks = HashMap::new();
    let mut wrappers = HashMap::new();
    for name in names {
        let sink = Arc::new(ScriptedSink::new(*name));
        let wrapper = Arc::new(
            TransportWrapper::new(
                sink.clone(),
                quick_policy(2),
                CircuitBreaker::new(100, Duration::from_secs(30)),
                ErrorRateLimiter::new(100),
                ErrorHandler::default(),
                monitor.clone(),
            )
            .with_sleeper(TrackingSleeper::new()),
        );
        sinks.insert(name.to_string(), sink);
        wrappers.insert(name.to_string(), wrapper);
    }
    let config = FailoverConfig {
        enable: true,
        chain,
        max_depth: 3,
        send_timeout: Duration::from_secs(10),
    };
    let dispatcher = FailoverDispatcher::new(monitor.clone(), wrappers, config);
    Fixture { sinks, monitor, dispatcher }
}

#[tokio::test]
async fn healthy_primary_handles_the_batch() {
    let fixture = fixture(&["otlp", "console"], vec!["console".to_string()], HealthConfig::default());
    let report = fixture.dispatcher.dispatch("otlp", &batch(&["a", "b"])).await.unwrap();
    assert_eq!(report.sink_used, "otlp");
    assert!(!report.fallback_used);
    assert_eq!(fixture.sinks["console"].calls(), 0);
    let stats = fixture.dispatcher.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.fallback_used, 0);
}

#[tokio::test]
async fn failing_primary_falls_over_preserving_order() {
    let health = HealthConfig { failure_threshold: 1, ..HealthConfig::default() };
    let fixture = fixture(&["otlp", "console"], vec!["console".to_string()], health);
    // Exhaust both attempts of the primary's wrapper.
    fixture.sinks["otlp"]
        .fail_times(2, SinkError::new("ECONNREFUSED").with_retryable(true));

    let report =
        fixture.dispatcher.dispatch("otlp", &batch(&["a", "b", "c"])).await.unwrap();
    assert_eq!(report.sink_used, "console");
    assert!(report.fallback_used);

    // The fallback received exactly the same records in the same order.
    assert_eq!(fixture.sinks["console"].delivered(), vec![vec!["a", "b", "c"]]);
    assert!(!fixture.monitor.is_healthy("otlp"), "primary marked unhealthy");

    let stats = fixture.dispatcher.stats();
    assert_eq!(stats.delivered, 1, "fallback delivery still counts as delivered");
    assert_eq!(stats.fallback_used, 1);
    assert_eq!(stats.failed_sends, 1);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test]
async fn unhealthy_primary_is_skipped_but_last_resort_is_always_tried() {
    let health = HealthConfig { failure_threshold: 1, ..HealthConfig::default() };
    let fixture = fixture(&["otlp", "console"], vec!["console".to_string()], health);
    fixture.monitor.record_failure("otlp");
    assert!(!fixture.monitor.is_healthy("otlp"));

    let report = fixture.dispatcher.dispatch("otlp", &batch(&["x"])).await.unwrap();
    assert_eq!(report.sink_used, "console");
    assert_eq!(fixture.sinks["otlp"].calls(), 0, "unhealthy primary skipped entirely");

    // Even an unhealthy console is tried when it is the last resort.
    fixture.monitor.record_failure("console");
    assert!(!fixture.monitor.is_healthy("console"));
    let report = fixture.dispatcher.dispatch("otlp", &batch(&["y"])).await.unwrap();
    assert_eq!(report.sink_used, "console");
}

#[tokio::test]
async fn exhausted_chain_drops_the_batch() {
    let fixture = fixture(&["otlp", "console"], vec!["console".to_string()], HealthConfig::default());
    fixture.sinks["otlp"].fail_times(2, SinkError::new("ECONNREFUSED").with_retryable(true));
    fixture.sinks["console"].fail_times(2, SinkError::new("broken pipe"));

    let err = fixture.dispatcher.dispatch("otlp", &batch(&["x"])).await.unwrap_err();
    match err {
        PipelineError::FailoverExhausted { chain_len, source } => {
            assert_eq!(chain_len, 2);
            assert!(source.message().contains("broken pipe"));
        }
        other => panic!("expected FailoverExhausted, got {other:?}"),
    }
    let stats = fixture.dispatcher.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.delivered, 0, "a dropped batch is never also counted as delivered");
}

#[tokio::test]
async fn chain_deduplicates_and_respects_max_depth() {
    let fixture = fixture(
        &["a", "b", "c", "d", "e"],
        vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()],
        HealthConfig::default(),
    );
    // Primary repeated in the chain is not tried twice; depth caps fallbacks.
    for name in ["a", "b", "c", "d"] {
        fixture.sinks[name].fail_times(2, SinkError::new("ECONNREFUSED").with_retryable(true));
    }
    let err = fixture.dispatcher.dispatch("a", &batch(&["x"])).await.unwrap_err();
    match err {
        PipelineError::FailoverExhausted { chain_len, .. } => {
            assert_eq!(chain_len, 4, "primary plus max_depth fallbacks");
        }
        other => panic!("expected FailoverExhausted, got {other:?}"),
    }
    assert_eq!(fixture.sinks["a"].calls(), 2, "primary tried once (two attempts)");
    assert_eq!(fixture.sinks["e"].calls(), 0, "beyond max_depth never tried");
}

#[tokio::test]
async fn disabled_fallback_stops_at_the_primary() {
    let monitor = Arc::new(HealthMonitor::new(HealthConfig::default()));
    let primary = Arc::new(ScriptedSink::new("otlp"));
    let console = Arc::new(ScriptedSink::new("console"));
    primary.fail_times(2, SinkError::new("ECONNREFUSED").with_retryable(true));

    let mut wrappers = HashMap::new();
    for (name, sink) in [("otlp", primary.clone()), ("console", console.clone())] {
        wrappers.insert(
            name.to_string(),
            Arc::new(
                TransportWrapper::new(
                    sink as Arc<dyn logship::Sink>,
                    quick_policy(2),
                    CircuitBreaker::new(100, Duration::from_secs(30)),
                    ErrorRateLimiter::new(100),
                    ErrorHandler::default(),
                    monitor.clone(),
                )
                .with_sleeper(TrackingSleeper::new()),
            ),
        );
    }
    let dispatcher = FailoverDispatcher::new(
        monitor,
        wrappers,
        FailoverConfig {
            enable: false,
            chain: vec!["console".to_string()],
            max_depth: 3,
            send_timeout: Duration::from_secs(10),
        },
    );

    let err = dispatcher.dispatch("otlp", &batch(&["x"])).await.unwrap_err();
    assert!(matches!(err, PipelineError::FailoverExhausted { chain_len: 1, .. }));
    assert_eq!(console.calls(), 0);
}

#[tokio::test]
async fn per_send_timeout_moves_to_the_next_sink() {
    let health = HealthConfig { failure_threshold: 1, ..HealthConfig::default() };
    let monitor = Arc::new(HealthMonitor::new(health));
    let slow = Arc::new(ScriptedSink::new("slow"));
    slow.set_send_delay(Duration::from_millis(500));
    let console = Arc::new(ScriptedSink::new("console"));

    let mut wrappers = HashMap::new();
    for (name, sink) in [("slow", slow.clone()), ("console", console.clone())] {
        wrappers.insert(
            name.to_string(),
            Arc::new(
                TransportWrapper::new(
                    sink as Arc<dyn logship::Sink>,
                    quick_policy(1),
                    CircuitBreaker::new(100, Duration::from_secs(30)),
                    ErrorRateLimiter::new(100),
                    ErrorHandler::default(),
                    monitor.clone(),
                )
                .with_sleeper(TrackingSleeper::new()),
            ),
        );
    }
    let dispatcher = FailoverDispatcher::new(
        monitor.clone(),
        wrappers,
        FailoverConfig {
            enable: true,
            chain: vec!["console".to_string()],
            max_depth: 3,
            send_timeout: Duration::from_millis(50),
        },
    );

    let report = dispatcher.dispatch("slow", &batch(&["x"])).await.unwrap();
    assert_eq!(report.sink_used, "console");
    assert_eq!(monitor.snapshot("slow").unwrap().consecutive_failures, 1);
}
