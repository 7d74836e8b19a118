#![forbid(unsafe_code)]

//! # logship
//!
//! Reliable structured log delivery for async Rust: records are coalesced
//! into bounded batches and dispatched to heterogeneous sinks (console,
//! rotated files, OTLP collectors, Redis) under explicit backpressure,
//! retry, circuit-breaking, and failover policies.
//!
//! ## Architecture
//!
//! - [`BatchManager`] buffers records and releases batches on size or age
//!   triggers, with a hard pending cap and bounded processor concurrency.
//! - [`TransportWrapper`] turns a raw [`Sink`] into a policy-governed one:
//!   an attempt loop driven by the [`RetryPolicyTable`], a [`CircuitBreaker`]
//!   per sink, and rate-limited error handling.
//! - [`HealthMonitor`] tracks per-sink health from send outcomes and a
//!   background probe loop; [`FailoverDispatcher`] walks the fallback chain
//!   when the primary is degraded.
//! - Concrete sinks live in their own crates (`logship-file`,
//!   `logship-otlp`, `logship-redis`); the console sink ships here as the
//!   fallback of last resort.
//!
//! ## Quick start
//!
//! ```no_run
//! use logship::{Level, LogRecord, Metadata, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), logship::PipelineError> {
//!     let config: PipelineConfig = serde_json::from_str(
//!         r#"{ "transports": [{ "name": "console", "type": "console" }] }"#,
//!     )
//!     .expect("valid config");
//!     let pipeline = Pipeline::builder(config).build()?;
//!
//!     let record = LogRecord::builder(Level::Info, "service started")
//!         .metadata(Metadata::new("billing", "production"))
//!         .field("port", 8080)
//!         .build();
//!     pipeline.log(record)?;
//!
//!     pipeline.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! At-most-once for records that exhaust every sink in the fallback chain:
//! after retries and failover the batch is dropped and counted, never
//! buffered indefinitely. Records within a batch keep insertion order
//! through every sink; concurrent batches may complete out of order.

mod alert;
mod batch;
mod breaker;
mod classify;
mod config;
mod error;
mod handler;
mod health;
mod pipeline;
mod policy;
mod rate_limit;
mod record;
mod registry;
mod serialize;
mod sink;
mod time;
mod wrapper;

// Re-exports
pub use alert::{AlertProvider, ConsoleAlertProvider};
pub use batch::{BatchConfig, BatchManager, Processor};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use classify::{
    classify, CategorizedError, ErrorCategory, ErrorContext, RecoveryStrategy, Severity,
};
pub use config::{
    BatchSettings, CircuitSettings, FallbackSettings, FileSinkConfig, HealthSettings,
    MaskingSettings, OtlpSinkConfig, PerformanceSettings, PipelineConfig, RedisMode,
    RedisSinkConfig, RetrySettings, RotationInterval, TransportConfig, TransportKind,
};
pub use error::{ConfigError, PipelineError, SinkError};
pub use handler::ErrorHandler;
pub use health::{
    DispatchReport, DispatchStats, DispatchStatsSnapshot, FailoverConfig, FailoverDispatcher,
    HealthConfig, HealthMonitor, HealthProbe, SinkHealthSnapshot, RESPONSE_RING_SIZE,
};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use policy::{default_backoff_multiplier, RetryPolicy, RetryPolicyTable, SinkPolicy};
pub use rate_limit::ErrorRateLimiter;
pub use record::{
    Batch, DatabaseMetadata, Level, LogRecord, Metadata, Performance, RecordBuilder,
    RequestMetadata, SecurityMetadata, NON_SERIALIZABLE,
};
pub use registry::{ResourceId, ResourceKind, ResourceRegistry};
pub use serialize::{
    compress, compress_large, MaskingConfig, Serializer, CIRCULAR_REFERENCE, MASK_SENTINEL,
    STREAM_THRESHOLD,
};
pub use sink::{ConsoleSink, Sink};
pub use time::{
    Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper,
};
pub use wrapper::TransportWrapper;

pub mod prelude;
