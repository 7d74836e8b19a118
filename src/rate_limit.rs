//! Per-(sink, category) error rate limiting.
//!
//! A sliding sixty-second window decides whether an error is worth the
//! expensive handling path (alerting, emitting the error itself). Suppressed
//! errors still land in the window and in health stats; `Critical` errors
//! are never suppressed.

use crate::classify::CategorizedError;
use crate::time::{Clock, MonotonicClock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const WINDOW_MILLIS: u64 = 60_000;

/// Sliding-window limiter for error handling work.
#[derive(Clone)]
pub struct ErrorRateLimiter {
    max_per_minute: usize,
    windows: Arc<Mutex<HashMap<(String, String), VecDeque<u64>>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ErrorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRateLimiter")
            .field("max_per_minute", &self.max_per_minute)
            .finish()
    }
}

impl ErrorRateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            windows: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Record the error and report whether full handling should run.
    pub fn should_process(&self, sink: &str, err: &CategorizedError) -> bool {
        let now = self.clock.now_millis();
        let key = (sink.to_string(), err.category.as_str().to_string());
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let window = windows.entry(key).or_default();
        while window.front().is_some_and(|&t| now.saturating_sub(t) >= WINDOW_MILLIS) {
            window.pop_front();
        }
        let under_limit = window.len() < self.max_per_minute;
        window.push_back(now);
        under_limit || err.is_critical()
    }

    /// Errors currently inside the window for `(sink, category)`.
    pub fn window_count(&self, sink: &str, category: &str) -> usize {
        let now = self.clock.now_millis();
        let windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        windows
            .get(&(sink.to_string(), category.to_string()))
            .map(|w| w.iter().filter(|&&t| now.saturating_sub(t) < WINDOW_MILLIS).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ErrorContext};
    use crate::error::SinkError;
    use crate::time::ManualClock;

    fn network_error() -> CategorizedError {
        classify(&SinkError::new("connection refused"), &ErrorContext::new("send"))
    }

    fn critical_error() -> CategorizedError {
        classify(&SinkError::new("disk full"), &ErrorContext::new("send"))
    }

    #[test]
    fn allows_up_to_the_limit_then_suppresses() {
        let clock = ManualClock::new();
        let limiter = ErrorRateLimiter::new(3).with_clock(clock);
        for _ in 0..3 {
            assert!(limiter.should_process("otlp", &network_error()));
        }
        assert!(!limiter.should_process("otlp", &network_error()));
        assert_eq!(limiter.window_count("otlp", "network"), 4);
    }

    #[test]
    fn keys_are_independent_per_sink_and_category() {
        let clock = ManualClock::new();
        let limiter = ErrorRateLimiter::new(1).with_clock(clock);
        assert!(limiter.should_process("otlp", &network_error()));
        assert!(!limiter.should_process("otlp", &network_error()));
        // Different sink, same category: fresh window.
        assert!(limiter.should_process("file", &network_error()));
        // Same sink, different category: fresh window.
        let timeout = classify(&SinkError::new("timed out"), &ErrorContext::new("send"));
        assert!(limiter.should_process("otlp", &timeout));
    }

    #[test]
    fn window_slides_after_sixty_seconds() {
        let clock = ManualClock::new();
        let limiter = ErrorRateLimiter::new(1).with_clock(clock.clone());
        assert!(limiter.should_process("otlp", &network_error()));
        assert!(!limiter.should_process("otlp", &network_error()));

        clock.advance(WINDOW_MILLIS);
        assert!(limiter.should_process("otlp", &network_error()));
    }

    #[test]
    fn critical_errors_are_never_suppressed() {
        let clock = ManualClock::new();
        let limiter = ErrorRateLimiter::new(1).with_clock(clock);
        assert!(limiter.should_process("file", &critical_error()));
        for _ in 0..10 {
            assert!(limiter.should_process("file", &critical_error()));
        }
        // Suppressed-or-not, every occurrence is counted.
        assert_eq!(limiter.window_count("file", "resource"), 11);
    }
}
