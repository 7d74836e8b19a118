//! Alerting for errors that survive rate limiting.

use crate::classify::CategorizedError;
use async_trait::async_trait;

/// Receives critical pipeline failures. Implementations must be best-effort:
/// an alert that cannot be delivered is dropped, never propagated.
#[async_trait]
pub trait AlertProvider: Send + Sync {
    async fn alert(&self, err: &CategorizedError);
}

/// Default provider: one structured line per alert on the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleAlertProvider;

#[async_trait]
impl AlertProvider for ConsoleAlertProvider {
    async fn alert(&self, err: &CategorizedError) {
        tracing::error!(
            category = %err.category,
            severity = ?err.severity,
            operation = %err.context.operation,
            transport = err.context.transport.as_deref().unwrap_or("-"),
            attempt = err.context.attempt,
            error = %err.error,
            "pipeline alert"
        );
    }
}
