//! Configuration for a batch engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// What happens to a batch when a single item inside a fan-out stage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemFailurePolicy {
    /// Only the failing item's caller observes the error; its batch-mates
    /// continue through the remaining stages.
    #[default]
    Isolate,

    /// The first item error fails every entry of the batch.
    FailBatch,
}

impl ItemFailurePolicy {
    /// Parse the snake_case name used in configuration
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "isolate" => Some(Self::Isolate),
            "fail_batch" | "fail-batch" => Some(Self::FailBatch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolate => "isolate",
            Self::FailBatch => "fail_batch",
        }
    }
}

/// Configuration for the batch engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of entries handed to the batch function per flush
    pub max_batch_size: usize,

    /// Interval of the time-based flush
    pub batch_timeout: Duration,

    /// Buffer capacity as a multiple of `max_batch_size`.
    /// The default of 2 leaves room for one full batch to accumulate while
    /// another is being processed.
    pub capacity_factor: usize,

    /// Failure handling for per-item stages
    pub item_failure: ItemFailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_timeout: Duration::from_millis(50),
            capacity_factor: 2,
            item_failure: ItemFailurePolicy::default(),
        }
    }
}

impl BatchConfig {
    /// Create a config with the given size and timeout, other fields default
    pub fn new(max_batch_size: usize, batch_timeout: Duration) -> Self {
        Self { max_batch_size, batch_timeout, ..Self::default() }
    }

    /// Create config optimized for low latency (small batches, short waits)
    pub fn low_latency() -> Self {
        Self {
            max_batch_size: 4,
            batch_timeout: Duration::from_millis(5),
            capacity_factor: 2,
            item_failure: ItemFailurePolicy::Isolate,
        }
    }

    /// Create config optimized for high throughput (large batches)
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 256,
            batch_timeout: Duration::from_millis(200),
            capacity_factor: 4,
            item_failure: ItemFailurePolicy::Isolate,
        }
    }

    /// Builder-style setter for the item failure policy
    pub fn with_item_failure(mut self, policy: ItemFailurePolicy) -> Self {
        self.item_failure = policy;
        self
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BATCHFLOW_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_batch_size = n;
            }
        }

        if let Ok(val) = std::env::var("BATCHFLOW_BATCH_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.batch_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(val) = std::env::var("BATCHFLOW_CAPACITY_FACTOR") {
            if let Ok(n) = val.parse() {
                config.capacity_factor = n;
            }
        }

        if let Ok(val) = std::env::var("BATCHFLOW_ITEM_FAILURE") {
            if let Some(policy) = ItemFailurePolicy::parse(&val) {
                config.item_failure = policy;
            }
        }

        config
    }

    /// Buffer capacity derived from the batch size
    pub fn buffer_capacity(&self) -> usize {
        self.max_batch_size.saturating_mul(self.capacity_factor)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// - `PipelineError::Config` if `max_batch_size` is 0
    /// - `PipelineError::Config` if `batch_timeout` is zero
    /// - `PipelineError::Config` if `capacity_factor` is 0
    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_batch_size == 0 {
            return Err(PipelineError::config("max_batch_size must be > 0"));
        }

        if self.batch_timeout.is_zero() {
            return Err(PipelineError::config("batch_timeout must be > 0"));
        }

        if self.capacity_factor == 0 {
            return Err(PipelineError::config("capacity_factor must be > 0"));
        }

        Ok(())
    }
}
