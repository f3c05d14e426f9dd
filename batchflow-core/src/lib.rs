//! batchflow core library
//!
//! Coalesces single-value submissions from many call sites into batches,
//! processes each batch once (optionally fanning per-item stages out across a
//! worker pool) and resolves every caller's own result handle.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use batchflow_core::{Pipeline, WorkerPool};
//!
//! let pipeline = Pipeline::builder(WorkerPool::current()?)
//!     .batched(2, Duration::from_secs(300))
//!     .map(|s: String| s.len())
//!     .map(|n: usize| format!("{n:b}"))
//!     .sequential()?
//!     .build();
//!
//! assert_eq!(pipeline.submit("111".to_string()).await?, "11");
//! pipeline.shutdown().await;
//! ```

pub mod buffer;
pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod handle;
pub mod metrics;
pub mod pipeline;
pub mod trigger;

mod chain;
mod stage;

pub use builder::{BatchedBuilder, PipelineBuilder};
pub use config::{BatchConfig, ItemFailurePolicy};
pub use engine::{BatchEngine, BatchFn};
pub use error::{BoxError, PipelineError, PipelineResult};
pub use executor::{BoundedExecutor, Executor, Job, TaskPerItemExecutor, WorkerPool};
pub use fanout::FanOut;
pub use handle::ResultHandle;
pub use metrics::{EngineMetrics, FlushCause, MetricsSnapshot};
pub use pipeline::Pipeline;
pub use trigger::{FlushTrigger, TriggerState};
