//! Circuit breaker with lock-free atomics.
//!
//! Unlike a closure-wrapping breaker, this one exposes an explicit
//! `can_execute` / `on_success` / `on_failure` surface: the transport
//! wrapper owns the attempt loop and reports outcomes itself.

use crate::time::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

struct Inner {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

/// Three-state breaker: closed → open after `failure_threshold` consecutive
/// failures; open → half-open after `cooldown`; half-open admits a single
/// probe whose outcome closes or re-opens the circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self::with_config(BreakerConfig { failure_threshold, cooldown })
    }

    pub fn with_config(config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probe_in_flight: AtomicBool::new(false),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Whether a call may proceed. Transitions open → half-open once the
    /// cooldown has elapsed and admits exactly one probe in half-open.
    pub fn can_execute(&self) -> bool {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_CLOSED => return true,
                STATE_OPEN => {
                    let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.cooldown.as_millis() as u64 {
                        return false;
                    }
                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("circuit breaker half-open");
                            self.inner.probe_in_flight.store(true, Ordering::Release);
                            return true;
                        }
                        // Someone else transitioned; re-evaluate.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // One probe at a time.
                    return !self.inner.probe_in_flight.swap(true, Ordering::AcqRel);
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.consecutive_failures.store(0, Ordering::Release);
                    self.inner.opened_at_millis.store(0, Ordering::Release);
                    self.inner.probe_in_flight.store(false, Ordering::Release);
                    tracing::info!("circuit breaker closed");
                }
            }
            STATE_CLOSED => {
                self.inner.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.inner.probe_in_flight.store(false, Ordering::Release);
                    tracing::warn!(failures, "circuit breaker probe failed, re-opened");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.inner.consecutive_failures.load(Ordering::Acquire)
    }
}
