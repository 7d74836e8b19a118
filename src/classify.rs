//! Pure error classification.
//!
//! Every failure in the pipeline passes through [`classify`] exactly once;
//! the resulting category, severity, and retryability drive the retry
//! policy, circuit breaker, and rate limiter. Rules apply in order; the
//! first match wins.

use crate::error::SinkError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Serialization,
    Validation,
    Configuration,
    Transport,
    Resource,
    Authentication,
    RateLimit,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rateLimit",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How the pipeline should react to a categorized failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    CircuitBreaker,
    Ignore,
    FailFast,
}

/// Where the failure happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub transport: Option<String>,
    pub attempt: usize,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), transport: None, attempt: 0 }
    }

    pub fn for_transport(operation: impl Into<String>, transport: impl Into<String>) -> Self {
        Self { operation: operation.into(), transport: Some(transport.into()), attempt: 0 }
    }

    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }
}

/// A classified failure.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    pub error: SinkError,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub strategy: RecoveryStrategy,
    pub context: ErrorContext,
    pub at: DateTime<Utc>,
}

impl CategorizedError {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

const NETWORK_TOKENS: &[&str] =
    &["network", "connection", "econnrefused", "enotfound", "etimedout"];
const TIMEOUT_TOKENS: &[&str] = &["timeout", "timed out"];
const SERIALIZATION_TOKENS: &[&str] = &["json", "parse", "serialize", "circular"];
const VALIDATION_TOKENS: &[&str] = &["validation", "schema", "required"];
const CONFIG_TOKENS: &[&str] = &["config", "invalid", "missing"];
const RESOURCE_TOKENS: &[&str] = &["memory", "disk", "space", "resource"];
const AUTH_TOKENS: &[&str] = &["auth", "unauthorized", "forbidden"];
const RATE_TOKENS: &[&str] = &["rate", "limit", "throttle"];

fn contains_any(haystack: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|t| haystack.contains(t))
}

fn categorize(err: &SinkError, ctx: &ErrorContext) -> ErrorCategory {
    let message = err.message().to_lowercase();
    let operation = ctx.operation.to_lowercase();
    let status = err.status();

    if contains_any(&message, NETWORK_TOKENS) {
        ErrorCategory::Network
    } else if contains_any(&message, TIMEOUT_TOKENS) {
        ErrorCategory::Timeout
    } else if contains_any(&message, SERIALIZATION_TOKENS) {
        ErrorCategory::Serialization
    } else if contains_any(&message, VALIDATION_TOKENS) {
        ErrorCategory::Validation
    } else if contains_any(&message, CONFIG_TOKENS) || operation.contains("config") {
        ErrorCategory::Configuration
    } else if ctx.transport.is_some() && message.contains("transport") {
        ErrorCategory::Transport
    } else if contains_any(&message, RESOURCE_TOKENS) {
        ErrorCategory::Resource
    } else if contains_any(&message, AUTH_TOKENS) || matches!(status, Some(401) | Some(403)) {
        ErrorCategory::Authentication
    } else if contains_any(&message, RATE_TOKENS) || status == Some(429) {
        ErrorCategory::RateLimit
    } else {
        ErrorCategory::Unknown
    }
}

/// Default severity per category.
pub fn default_severity(category: ErrorCategory) -> Severity {
    match category {
        ErrorCategory::Configuration | ErrorCategory::Resource => Severity::Critical,
        ErrorCategory::Validation
        | ErrorCategory::Serialization
        | ErrorCategory::Authentication => Severity::High,
        ErrorCategory::Network
        | ErrorCategory::Timeout
        | ErrorCategory::Transport
        | ErrorCategory::RateLimit => Severity::Medium,
        ErrorCategory::Unknown => Severity::Low,
    }
}

fn default_retryable(category: ErrorCategory, status: Option<u16>) -> bool {
    if matches!(status, Some(400) | Some(401) | Some(403) | Some(404)) {
        return false;
    }
    !matches!(
        category,
        ErrorCategory::Configuration | ErrorCategory::Validation | ErrorCategory::Serialization
    )
}

fn default_strategy(category: ErrorCategory, retryable: bool) -> RecoveryStrategy {
    match category {
        ErrorCategory::Configuration => RecoveryStrategy::FailFast,
        ErrorCategory::Validation | ErrorCategory::Serialization => RecoveryStrategy::Ignore,
        ErrorCategory::Authentication => RecoveryStrategy::CircuitBreaker,
        ErrorCategory::Transport => RecoveryStrategy::Fallback,
        _ if retryable => RecoveryStrategy::Retry,
        _ => RecoveryStrategy::Fallback,
    }
}

/// Map a sink failure to its category, severity, retryability, and recovery
/// strategy. A sink-provided retryability hint (e.g. HTTP status
/// classification) overrides the message scan.
pub fn classify(err: &SinkError, ctx: &ErrorContext) -> CategorizedError {
    let category = categorize(err, ctx);
    let severity = default_severity(category);
    let retryable = err
        .retryable_hint()
        .unwrap_or_else(|| default_retryable(category, err.status()));
    let strategy = default_strategy(category, retryable);
    CategorizedError {
        error: err.clone(),
        category,
        severity,
        retryable,
        strategy,
        context: ctx.clone(),
        at: Utc::now(),
    }
}
