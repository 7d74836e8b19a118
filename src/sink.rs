//! The sink capability trait and the console sink, the pipeline's fallback
//! of last resort.

use crate::error::SinkError;
use crate::record::{Batch, Level};
use crate::serialize::Serializer;
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;

/// A destination that consumes batches of records.
///
/// Implementations reduce their native failures to [`SinkError`]; the
/// transport wrapper supplies retries, circuit breaking, and health
/// accounting around `send`.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name used for policy lookup, health tracking, and fallback
    /// chain configuration.
    fn name(&self) -> &str;

    /// Deliver one batch. Records must be handled in order.
    async fn send(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Flush buffered state where the sink has any.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Release resources. Must be idempotent.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Lightweight health probe used by the monitor loop.
    async fn check_health(&self) -> bool {
        true
    }

    /// Per-attempt deadline the wrapper applies around `send`, if any.
    fn send_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Writes serialized records to the process's standard streams: `warn` and
/// above to stderr, the rest to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    serializer: Serializer,
}

impl ConsoleSink {
    pub const NAME: &'static str = "console";

    pub fn new(serializer: Serializer) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut out = Vec::new();
        let mut err_out = Vec::new();
        for record in batch.records() {
            let line = self.serializer.serialize(record);
            if record.level >= Level::Warn {
                err_out.extend_from_slice(&line);
            } else {
                out.extend_from_slice(&line);
            }
        }
        if !out.is_empty() {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&out).map_err(|e| SinkError::io(&e))?;
        }
        if !err_out.is_empty() {
            let stderr = std::io::stderr();
            let mut handle = stderr.lock();
            handle.write_all(&err_out).map_err(|e| SinkError::io(&e))?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        std::io::stdout().flush().map_err(|e| SinkError::io(&e))?;
        std::io::stderr().flush().map_err(|e| SinkError::io(&e))
    }
}
