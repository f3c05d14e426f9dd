//! Metrics for a batch engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCause {
    /// The buffer reached `max_batch_size`
    Size,
    /// The flush interval elapsed
    Timer,
    /// Final drain during shutdown
    Shutdown,
}

impl std::fmt::Display for FlushCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushCause::Size => write!(f, "size"),
            FlushCause::Timer => write!(f, "timer"),
            FlushCause::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Lock-free counters for one engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Entries accepted into the buffer
    pub items_submitted: AtomicU64,

    /// Submissions refused because the engine was closing
    pub items_rejected: AtomicU64,

    /// Entries resolved with a value
    pub items_completed: AtomicU64,

    /// Entries resolved with an error
    pub items_failed: AtomicU64,

    /// Non-empty flushes that invoked the batch function
    pub batches_flushed: AtomicU64,

    /// Batches whose function call failed as a whole
    pub batches_failed: AtomicU64,

    /// Total entries in flushed batches (for batch size averaging)
    pub total_batch_items: AtomicU64,

    /// Flushes caused by the size threshold
    pub size_flushes: AtomicU64,

    /// Flushes caused by the timer
    pub timer_flushes: AtomicU64,

    /// Maximum buffer depth observed at submission
    pub max_depth: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission and the buffer depth it produced
    pub fn record_submitted(&self, depth: usize) {
        self.items_submitted.fetch_add(1, Ordering::Relaxed);
        let depth = depth as u64;
        let mut current_max = self.max_depth.load(Ordering::Relaxed);
        while depth > current_max {
            match self.max_depth.compare_exchange_weak(
                current_max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    pub fn record_rejected(&self) {
        self.items_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a non-empty flush of `batch_size` entries
    pub fn record_flush(&self, batch_size: usize, cause: FlushCause) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.total_batch_items.fetch_add(batch_size as u64, Ordering::Relaxed);
        match cause {
            FlushCause::Size => self.size_flushes.fetch_add(1, Ordering::Relaxed),
            FlushCause::Timer => self.timer_flushes.fetch_add(1, Ordering::Relaxed),
            FlushCause::Shutdown => 0,
        };
    }

    /// Record per-item outcomes of one batch
    pub fn record_outcomes(&self, completed: usize, failed: usize) {
        self.items_completed.fetch_add(completed as u64, Ordering::Relaxed);
        self.items_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Record a batch that failed as a whole
    pub fn record_batch_failure(&self, batch_size: usize) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.items_failed.fetch_add(batch_size as u64, Ordering::Relaxed);
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_flushed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_items.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_rejected: self.items_rejected.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
            timer_flushes: self.timer_flushes.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
        }
    }
}

/// Snapshot of engine metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub items_submitted: u64,
    pub items_rejected: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub size_flushes: u64,
    pub timer_flushes: u64,
    pub max_depth: u64,
    pub avg_batch_size: f64,
}
