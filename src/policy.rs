//! Per-sink retry policies and the table that resolves them by sink name.

use crate::classify::{CategorizedError, ErrorCategory, Severity};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Backoff parameters for one sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: Duration,
    ) -> Self {
        Self { max_attempts, initial_delay, max_delay, multiplier, jitter }
    }

    /// Delay before retrying after attempt `n` (1-indexed):
    /// `min(initial · multiplier^(n-1) · category_multiplier + uniform(0, jitter), max)`.
    pub fn delay_for(&self, attempt: usize, category_multiplier: f64) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay(attempt, category_multiplier)
            .saturating_add(jitter)
            .min(self.max_delay)
    }

    /// The deterministic part of the delay, before jitter and capping.
    pub fn base_delay(&self, attempt: usize, category_multiplier: f64) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scale = self.multiplier.powi(exponent) * category_multiplier;
        let millis = (self.initial_delay.as_millis() as f64 * scale).min(u64::MAX as f64);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

type Predicate = Arc<dyn Fn(&CategorizedError) -> bool + Send + Sync>;
type Multiplier = Arc<dyn Fn(&CategorizedError) -> f64 + Send + Sync>;

/// Retry parameters plus the per-category predicates for one sink.
#[derive(Clone)]
pub struct SinkPolicy {
    retry: RetryPolicy,
    retryable: Predicate,
    circuit_break: Predicate,
    backoff_multiplier: Multiplier,
}

impl std::fmt::Debug for SinkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkPolicy").field("retry", &self.retry).finish()
    }
}

/// Category multiplier applied to backoff: rate-limited errors back off
/// hardest, network errors harder than the rest.
pub fn default_backoff_multiplier(err: &CategorizedError) -> f64 {
    match err.category {
        ErrorCategory::RateLimit => 3.0,
        ErrorCategory::Network => 2.0,
        _ => 1.0,
    }
}

fn default_should_circuit_break(err: &CategorizedError) -> bool {
    err.severity == Severity::Critical
        || matches!(
            err.category,
            ErrorCategory::Configuration | ErrorCategory::Authentication
        )
}

impl SinkPolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            retryable: Arc::new(|err| err.retryable),
            circuit_break: Arc::new(default_should_circuit_break),
            backoff_multiplier: Arc::new(default_backoff_multiplier),
        }
    }

    /// Replace the retryability predicate (may be stricter than the
    /// classifier's verdict).
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CategorizedError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn with_circuit_break<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CategorizedError) -> bool + Send + Sync + 'static,
    {
        self.circuit_break = Arc::new(predicate);
        self
    }

    pub fn with_backoff_multiplier<F>(mut self, multiplier: F) -> Self
    where
        F: Fn(&CategorizedError) -> f64 + Send + Sync + 'static,
    {
        self.backoff_multiplier = Arc::new(multiplier);
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn max_attempts(&self) -> usize {
        self.retry.max_attempts
    }

    pub fn is_retryable(&self, err: &CategorizedError) -> bool {
        (self.retryable)(err)
    }

    pub fn should_circuit_break(&self, err: &CategorizedError) -> bool {
        (self.circuit_break)(err)
    }

    /// Backoff delay after a failed attempt (1-indexed), jittered and capped.
    pub fn delay_after(&self, attempt: usize, err: &CategorizedError) -> Duration {
        self.retry.delay_for(attempt, (self.backoff_multiplier)(err))
    }
}

/// Policies keyed by sink name with a `default` fallback entry.
#[derive(Debug, Clone)]
pub struct RetryPolicyTable {
    policies: HashMap<String, SinkPolicy>,
    fallback: SinkPolicy,
}

impl RetryPolicyTable {
    pub const DEFAULT_KEY: &'static str = "default";

    /// Empty table with only the `default` policy.
    pub fn new(fallback: SinkPolicy) -> Self {
        Self { policies: HashMap::new(), fallback }
    }

    pub fn insert(&mut self, sink: impl Into<String>, policy: SinkPolicy) {
        let name = sink.into();
        if name == Self::DEFAULT_KEY {
            self.fallback = policy;
        } else {
            self.policies.insert(name, policy);
        }
    }

    /// Exact sink name first, then `default`.
    pub fn policy_for(&self, sink: &str) -> &SinkPolicy {
        self.policies.get(sink).unwrap_or(&self.fallback)
    }
}

impl Default for RetryPolicyTable {
    /// Built-in per-sink defaults. The console is deliberately the least
    /// persistent (it is the fallback of last resort and only resource
    /// errors there are worth a second try); redis the most.
    fn default() -> Self {
        let ms = Duration::from_millis;
        let mut table = Self::new(SinkPolicy::new(RetryPolicy::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            ms(200),
        )));
        table.insert(
            "console",
            SinkPolicy::new(RetryPolicy::new(2, ms(100), Duration::from_secs(1), 1.5, ms(50)))
                .with_retryable(|err| err.category == ErrorCategory::Resource),
        );
        table.insert(
            "file",
            SinkPolicy::new(RetryPolicy::new(5, ms(500), Duration::from_secs(10), 2.0, ms(200))),
        );
        table.insert(
            "otlp",
            SinkPolicy::new(RetryPolicy::new(
                5,
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
                ms(500),
            )),
        );
        table.insert(
            "redis",
            SinkPolicy::new(RetryPolicy::new(7, ms(500), Duration::from_secs(15), 1.8, ms(300))),
        );
        table
    }
}
