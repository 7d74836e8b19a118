//! Convenience re-exports for the common path.
//!
//! ```
//! use logship::prelude::*;
//! ```

pub use crate::{
    Batch, CategorizedError, ErrorCategory, Level, LogRecord, Metadata, Pipeline,
    PipelineBuilder, PipelineConfig, PipelineError, RecoveryStrategy, Severity, Sink, SinkError,
};
