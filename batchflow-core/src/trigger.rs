//! Size and timer flush triggers.
//!
//! Submitters call [`FlushTrigger::on_enqueue`] with the depth they observed.
//! The flush lane waits on [`FlushTrigger::signalled`] and on the ticker from
//! [`FlushTrigger::ticker`]; both sources feed the same lane so flushes are
//! strictly sequential.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;

/// Observable state of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// No flush pending or running
    Idle,
    /// A size signal is pending for the lane
    Scheduled,
    /// The lane is flushing
    Running,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerState::Idle => write!(f, "Idle"),
            TriggerState::Scheduled => write!(f, "Scheduled"),
            TriggerState::Running => write!(f, "Running"),
        }
    }
}

/// Dual size/timeout trigger for one engine
#[derive(Debug)]
pub struct FlushTrigger {
    batch_size: usize,
    period: Duration,
    notify: Notify,
    state: AtomicU8,
}

impl FlushTrigger {
    pub fn new(batch_size: usize, period: Duration) -> Self {
        Self { batch_size, period, notify: Notify::new(), state: AtomicU8::new(IDLE) }
    }

    /// React to a submission that left the buffer at `depth`.
    ///
    /// Returns true if a flush was signalled. Signals coalesce: while one is
    /// pending, further threshold crossings do not queue another.
    pub fn on_enqueue(&self, depth: usize) -> bool {
        if depth < self.batch_size {
            return false;
        }

        match self.state.compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.notify.notify_one();
                true
            }
            Err(SCHEDULED) => false,
            Err(_) => {
                // Running: the lane may already be past its last depth check.
                self.notify.notify_one();
                true
            }
        }
    }

    /// Wait for a size signal
    pub async fn signalled(&self) {
        self.notify.notified().await
    }

    /// Fixed-rate ticker; the first tick is one period after creation
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub(crate) fn begin_flush(&self) {
        self.state.store(RUNNING, Ordering::Release);
    }

    pub(crate) fn end_flush(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub fn state(&self) -> TriggerState {
        match self.state.load(Ordering::Acquire) {
            SCHEDULED => TriggerState::Scheduled,
            RUNNING => TriggerState::Running,
            _ => TriggerState::Idle,
        }
    }
}
