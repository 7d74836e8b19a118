//! The policy-enforcing shell around a raw sink.
//!
//! A [`TransportWrapper`] turns a best-effort `Sink::send` into a
//! policy-governed send: circuit-breaker gating, a bounded attempt loop with
//! category-aware backoff, error-handling rate limits, and health
//! accounting.

use crate::breaker::CircuitBreaker;
use crate::classify::{classify, CategorizedError, ErrorContext};
use crate::error::{PipelineError, SinkError};
use crate::handler::ErrorHandler;
use crate::health::{HealthMonitor, HealthProbe};
use crate::policy::SinkPolicy;
use crate::rate_limit::ErrorRateLimiter;
use crate::record::Batch;
use crate::sink::Sink;
use crate::time::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct TransportWrapper {
    sink: Arc<dyn Sink>,
    policy: SinkPolicy,
    breaker: CircuitBreaker,
    rate_limiter: ErrorRateLimiter,
    handler: ErrorHandler,
    monitor: Arc<HealthMonitor>,
    sleeper: Arc<dyn Sleeper>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for TransportWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportWrapper")
            .field("sink", &self.sink.name())
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl TransportWrapper {
    pub fn new(
        sink: Arc<dyn Sink>,
        policy: SinkPolicy,
        breaker: CircuitBreaker,
        rate_limiter: ErrorRateLimiter,
        handler: ErrorHandler,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            sink,
            policy,
            breaker,
            rate_limiter,
            handler,
            monitor,
            sleeper: Arc::new(TokioSleeper),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Send one batch under the full policy stack.
    pub async fn send(&self, batch: &Batch) -> Result<(), PipelineError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let name = self.sink.name().to_string();
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0usize;
        let mut last_error: Option<CategorizedError> = None;

        for attempt in 1..=max_attempts {
            // The breaker is consulted before the first send and before
            // every retry; concurrent sends may have tripped it meanwhile.
            if !self.breaker.can_execute() {
                if let Some(err) = last_error.take() {
                    self.monitor.record_failure(&name);
                    return Err(PipelineError::Delivery {
                        sink: name,
                        attempts,
                        source: err.error,
                    });
                }
                return Err(PipelineError::CircuitOpen {
                    sink: name,
                    failures: self.breaker.consecutive_failures(),
                });
            }

            attempts = attempt;
            let started = Instant::now();
            match self.attempt_send(batch).await {
                Ok(()) => {
                    self.monitor.record_success(&name, Some(started.elapsed()));
                    self.breaker.on_success();
                    return Ok(());
                }
                Err(sink_err) => {
                    let ctx = ErrorContext::for_transport("send", name.clone())
                        .with_attempt(attempt);
                    let categorized = classify(&sink_err, &ctx);
                    let suppressed = !self.rate_limiter.should_process(&name, &categorized);
                    self.handler.handle(&categorized, suppressed).await;

                    let stop = (suppressed && !categorized.is_critical())
                        || !self.policy.is_retryable(&categorized)
                        || self.policy.should_circuit_break(&categorized)
                        || attempt == max_attempts;
                    if stop {
                        last_error = Some(categorized);
                        break;
                    }

                    let delay = self.policy.delay_after(attempt, &categorized);
                    tracing::debug!(
                        sink = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        category = %categorized.category,
                        "retrying send after backoff"
                    );
                    last_error = Some(categorized);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // Terminal failure: one health mark and one breaker count per send.
        self.monitor.record_failure(&name);
        self.breaker.on_failure();
        let source = last_error
            .map(|e| e.error)
            .unwrap_or_else(|| SinkError::new("send failed"));
        Err(PipelineError::Delivery { sink: name, attempts, source })
    }

    async fn attempt_send(&self, batch: &Batch) -> Result<(), SinkError> {
        match self.sink.send_timeout() {
            Some(deadline) => match tokio::time::timeout(deadline, self.sink.send(batch)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::timeout(deadline)),
            },
            None => self.sink.send(batch).await,
        }
    }

    /// Flush the underlying sink. Non-critical flush failures are handled
    /// and swallowed so they cannot block shutdown.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        match self.sink.flush().await {
            Ok(()) => Ok(()),
            Err(sink_err) => {
                let ctx = ErrorContext::for_transport("flush", self.sink.name().to_string());
                let categorized = classify(&sink_err, &ctx);
                let suppressed =
                    !self.rate_limiter.should_process(self.sink.name(), &categorized);
                self.handler.handle(&categorized, suppressed).await;
                if categorized.is_critical() {
                    Err(PipelineError::Delivery {
                        sink: self.sink.name().to_string(),
                        attempts: 1,
                        source: sink_err,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Idempotent shutdown: stop accepting sends, drop out of the probe
    /// loop, close the sink.
    pub async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.monitor.unregister_probe(self.sink.name());
        if let Err(err) = self.sink.close().await {
            tracing::warn!(sink = self.sink.name(), error = %err, "sink close failed");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HealthProbe for TransportWrapper {
    fn name(&self) -> &str {
        self.sink.name()
    }

    async fn probe(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire) && self.sink.check_health().await
    }
}
