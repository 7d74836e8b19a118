//! Pipeline configuration.
//!
//! The deserialized shape mirrors the documented configuration mapping
//! (durations in milliseconds); `validate` rejects bad values synchronously
//! at construction, and the `to_*` converters produce the runtime configs
//! the engine components take.

use crate::batch::BatchConfig;
use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::health::{FailoverConfig, HealthConfig};
use crate::policy::{RetryPolicy, RetryPolicyTable, SinkPolicy};
use crate::record::Level;
use crate::serialize::MaskingConfig;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Minimum level admitted into the pipeline.
    pub level: Level,
    /// Ordered transports; the first enabled one is the primary.
    pub transports: Vec<TransportConfig>,
    pub batch: BatchSettings,
    /// Per-sink retry overrides; the key `default` replaces the fallback row.
    pub retry: HashMap<String, RetrySettings>,
    pub circuit: CircuitSettings,
    pub health: HealthSettings,
    pub fallback: FallbackSettings,
    pub masking: MaskingSettings,
    pub performance: PerformanceSettings,
    pub max_errors_per_minute: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            transports: Vec::new(),
            batch: BatchSettings::default(),
            retry: HashMap::new(),
            circuit: CircuitSettings::default(),
            health: HealthSettings::default(),
            fallback: FallbackSettings::default(),
            masking: MaskingSettings::default(),
            performance: PerformanceSettings::default(),
            max_errors_per_minute: 10,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.transports.iter().any(|t| t.enabled) {
            return Err(ConfigError::NoTransports);
        }
        self.batch.validate()?;
        self.circuit.validate()?;
        self.health.validate()?;
        self.performance.validate()?;
        for settings in self.retry.values() {
            settings.validate()?;
        }
        // Masking patterns must compile.
        self.masking.to_config()?;
        Ok(())
    }

    pub fn enabled_transports(&self) -> impl Iterator<Item = &TransportConfig> {
        self.transports.iter().filter(|t| t.enabled)
    }

    /// The built-in policy table with configured overrides applied.
    pub fn retry_table(&self) -> RetryPolicyTable {
        let mut table = RetryPolicyTable::default();
        for (sink, settings) in &self.retry {
            table.insert(sink.clone(), SinkPolicy::new(settings.to_policy()));
        }
        table
    }
}

/// One transport entry: a stable name, an enabled switch, and the
/// type-specific configuration under `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: TransportKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportKind {
    Console,
    File(FileSinkConfig),
    Otlp(OtlpSinkConfig),
    Redis(RedisSinkConfig),
}

/// File sink configuration (consumed by the file sink crate).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSinkConfig {
    pub path: String,
    /// Size-based rotation trigger, bytes.
    pub max_size: u64,
    pub rotation_interval: Option<RotationInterval>,
    /// Gzip rotated segments.
    pub compress: bool,
    pub retention_days: Option<u32>,
    pub max_files: Option<usize>,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            path: "logs/app.log".to_string(),
            max_size: 10 * 1024 * 1024,
            rotation_interval: None,
            compress: false,
            retention_days: Some(14),
            max_files: Some(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationInterval {
    Daily,
    Weekly,
    Monthly,
}

/// OTLP sink configuration (consumed by the OTLP sink crate).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OtlpSinkConfig {
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    /// Bodies strictly larger than this are gzip-compressed.
    pub compression_threshold: usize,
    pub user_agent: String,
}

impl Default for OtlpSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318/v1/logs".to_string(),
            headers: HashMap::new(),
            timeout_ms: 10_000,
            compression_threshold: 1024,
            user_agent: concat!("logship/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl OtlpSinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Redis sink configuration (consumed by the Redis sink crate).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisSinkConfig {
    pub url: String,
    pub mode: RedisMode,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RedisMode {
    List { list: String },
    Stream { stream: String, max_len: Option<u64> },
    Pubsub { channel: String },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchSettings {
    pub max_size: usize,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub max_queue_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_size: 100, timeout_ms: 5_000, max_concurrency: 4, max_queue_size: 10_000 }
    }
}

impl BatchSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("batch.maxSize", "must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("batch.maxConcurrency", "must be > 0"));
        }
        if self.max_queue_size < self.max_size {
            return Err(ConfigError::invalid(
                "batch.maxQueueSize",
                "must be >= batch.maxSize",
            ));
        }
        Ok(())
    }

    pub fn to_config(self) -> BatchConfig {
        BatchConfig {
            max_size: self.max_size,
            timeout: Duration::from_millis(self.timeout_ms),
            max_concurrency: self.max_concurrency,
            max_queue_size: self.max_queue_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 200,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.maxAttempts", "must be > 0"));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }

    pub fn to_policy(self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
            Duration::from_millis(self.jitter_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitSettings {
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_ms: 30_000 }
    }
}

impl CircuitSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit.failureThreshold", "must be > 0"));
        }
        Ok(())
    }

    pub fn to_config(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthSettings {
    pub check_interval_ms: u64,
    pub failure_threshold: usize,
    pub recovery_threshold: usize,
    pub timeout_ms: u64,
    pub enable_auto_recovery: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            failure_threshold: 3,
            recovery_threshold: 2,
            timeout_ms: 5_000,
            enable_auto_recovery: true,
        }
    }
}

impl HealthSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("health.failureThreshold", "must be > 0"));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigError::invalid("health.recoveryThreshold", "must be > 0"));
        }
        Ok(())
    }

    pub fn to_config(self) -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_millis(self.check_interval_ms),
            failure_threshold: self.failure_threshold,
            recovery_threshold: self.recovery_threshold,
            probe_timeout: Duration::from_millis(self.timeout_ms),
            auto_recovery: self.enable_auto_recovery,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FallbackSettings {
    pub enable: bool,
    pub chain: Vec<String>,
    pub max_depth: usize,
    pub timeout_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enable: true,
            chain: vec!["console".to_string()],
            max_depth: 3,
            timeout_ms: 10_000,
        }
    }
}

impl FallbackSettings {
    pub fn to_config(&self) -> FailoverConfig {
        FailoverConfig {
            enable: self.enable,
            chain: self.chain.clone(),
            max_depth: self.max_depth,
            send_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MaskingSettings {
    pub patterns: Vec<String>,
    pub preserve_length: bool,
    pub masking_char: char,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self { patterns: Vec::new(), preserve_length: false, masking_char: '*' }
    }
}

impl MaskingSettings {
    pub fn to_config(&self) -> Result<MaskingConfig, ConfigError> {
        MaskingConfig::new(&self.patterns, self.preserve_length, self.masking_char)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceSettings {
    /// Probability of attaching the performance block to a record.
    pub sample_rate: f64,
    pub system_metrics_interval_ms: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self { sample_rate: 1.0, system_metrics_interval_ms: 60_000 }
    }
}

impl PerformanceSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::invalid("performance.sampleRate", "must be in [0, 1]"));
        }
        Ok(())
    }

    /// Coin flip at the configured rate.
    pub fn should_sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            true
        } else if self.sample_rate <= 0.0 {
            false
        } else {
            rand::rng().random_bool(self.sample_rate)
        }
    }
}
