//! Central error handling: log the failure at a severity-appropriate level
//! and alert on critical errors. Always best-effort; nothing here can fail
//! the caller.

use crate::alert::{AlertProvider, ConsoleAlertProvider};
use crate::classify::{CategorizedError, Severity};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handles classified errors on behalf of every transport wrapper.
#[derive(Clone)]
pub struct ErrorHandler {
    provider: Arc<dyn AlertProvider>,
    handled: Arc<AtomicU64>,
    suppressed: Arc<AtomicU64>,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("handled", &self.handled.load(Ordering::Relaxed))
            .field("suppressed", &self.suppressed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(Arc::new(ConsoleAlertProvider))
    }
}

impl ErrorHandler {
    pub fn new(provider: Arc<dyn AlertProvider>) -> Self {
        Self {
            provider,
            handled: Arc::new(AtomicU64::new(0)),
            suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Process one classified failure. `suppressed` reflects the rate
    /// limiter's verdict: a suppressed non-critical error skips the
    /// expensive path but is still counted.
    pub async fn handle(&self, err: &CategorizedError, suppressed: bool) {
        if suppressed && !err.is_critical() {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                category = %err.category,
                transport = err.context.transport.as_deref().unwrap_or("-"),
                "error handling suppressed by rate limit"
            );
            return;
        }
        self.handled.fetch_add(1, Ordering::Relaxed);
        match err.severity {
            Severity::Critical => {
                tracing::error!(
                    category = %err.category,
                    operation = %err.context.operation,
                    error = %err.error,
                    "critical pipeline error"
                );
                self.provider.alert(err).await;
            }
            Severity::High => tracing::error!(
                category = %err.category,
                operation = %err.context.operation,
                error = %err.error,
                "pipeline error"
            ),
            Severity::Medium => tracing::warn!(
                category = %err.category,
                operation = %err.context.operation,
                error = %err.error,
                "pipeline error"
            ),
            Severity::Low => tracing::debug!(
                category = %err.category,
                operation = %err.context.operation,
                error = %err.error,
                "pipeline error"
            ),
        }
    }

    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ErrorContext};
    use crate::error::SinkError;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider(AtomicUsize);

    #[async_trait::async_trait]
    impl AlertProvider for CountingProvider {
        async fn alert(&self, _err: &CategorizedError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn critical() -> CategorizedError {
        classify(&SinkError::new("disk full"), &ErrorContext::new("send"))
    }

    fn medium() -> CategorizedError {
        classify(&SinkError::new("connection refused"), &ErrorContext::new("send"))
    }

    #[tokio::test]
    async fn critical_errors_alert() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let handler = ErrorHandler::new(provider.clone());
        handler.handle(&critical(), false).await;
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
        assert_eq!(handler.handled_count(), 1);
    }

    #[tokio::test]
    async fn non_critical_errors_do_not_alert() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let handler = ErrorHandler::new(provider.clone());
        handler.handle(&medium(), false).await;
        assert_eq!(provider.0.load(Ordering::SeqCst), 0);
        assert_eq!(handler.handled_count(), 1);
    }

    #[tokio::test]
    async fn suppression_skips_handling_except_critical() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let handler = ErrorHandler::new(provider.clone());

        handler.handle(&medium(), true).await;
        assert_eq!(handler.handled_count(), 0);
        assert_eq!(handler.suppressed_count(), 1);

        // Critical ignores the suppression verdict.
        handler.handle(&critical(), true).await;
        assert_eq!(handler.handled_count(), 1);
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }
}
