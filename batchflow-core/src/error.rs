//! Error types for the batchflow pipeline.
//!
//! Every failure a caller can observe on a [`ResultHandle`](crate::ResultHandle)
//! is a [`PipelineError`]. The type is `Clone` because a single batch-level
//! failure is delivered to every entry extracted into that batch.
//!
//! # Error Hierarchy
//!
//! ```text
//! PipelineError
//! ├── Config       - rejected at build time (empty stage list, zero batch size, ...)
//! ├── Stage        - a user stage returned an error
//! ├── Batch        - engine-level fault (output count mismatch, type mismatch)
//! ├── TaskAborted  - a stage panicked or its worker task vanished
//! ├── Shutdown     - the engine is closing and will not run the entry
//! └── Dropped      - the result sender disappeared without resolving
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from user stage functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors produced while building or running a pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Invalid builder or engine configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A stage function failed
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: usize,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The batch as a whole could not be processed
    #[error("Batch processing error: {message}")]
    Batch { message: String },

    /// A stage panicked or the task running it was dropped
    #[error("Task aborted: {message}")]
    TaskAborted { message: String },

    /// The engine was shut down before the entry could run
    #[error("Pipeline is shut down")]
    Shutdown,

    /// The result was dropped before completion
    #[error("Result was dropped before completion")]
    Dropped,
}

impl PipelineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    /// Create a batch error
    pub fn batch(msg: impl Into<String>) -> Self {
        Self::Batch { message: msg.into() }
    }

    /// Create a task-aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::TaskAborted { message: msg.into() }
    }

    /// Wrap an error returned by the stage at `stage` (0-based declaration index)
    pub fn stage(stage: usize, source: impl Into<BoxError>) -> Self {
        Self::Stage { stage, source: Arc::from(source.into()) }
    }

    /// Whether this error was raised at build time
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
