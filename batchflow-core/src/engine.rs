//! Batch engine: buffer + trigger + flush lane.
//!
//! # Architecture
//!
//! ```text
//! submitters ──enqueue──► BatchBuffer ──depth──► FlushTrigger
//!                              │                     │ size signal / tick
//!                              ▼                     ▼
//!                         BatchDrain ◄────────── flush lane (one task)
//!                              │
//!                     extract(max_batch_size)
//!                              │
//!                              ▼
//!                 batch_fn(values)   (blocking thread)
//!                              │
//!                              ▼
//!                resolve / fail every extracted handle
//! ```
//!
//! Flushes never overlap: the lane owns the drain half of the buffer and
//! awaits each batch before looking at the next trigger.
//!
//! # Shutdown
//!
//! Closing the engine stops the ticker, closes the buffer to new
//! submissions (they fail with `PipelineError::Shutdown`) and flushes every
//! entry that was already buffered before the lane exits. An engine closed
//! before it was started fails its buffered entries with `Shutdown`.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{batch_buffer, BatchBuffer, BatchDrain, PendingEntry};
use crate::config::BatchConfig;
use crate::error::{BoxError, PipelineError, PipelineResult};
use crate::executor::run_guarded;
use crate::handle::{ResultHandle, ResultSender};
use crate::metrics::{EngineMetrics, FlushCause, MetricsSnapshot};
use crate::stage::{downcast, Value};
use crate::trigger::{FlushTrigger, TriggerState};

/// Batch function with per-item outcomes.
///
/// Must return exactly one outcome per input, in input order. An `Err` fails
/// the whole batch.
pub type BatchFn<T, R> =
    Arc<dyn Fn(Vec<T>) -> PipelineResult<Vec<PipelineResult<R>>> + Send + Sync>;

enum Lane<T, R> {
    /// Built but not started: the lane's parts wait here
    Ready { drain: BatchDrain<T, R>, batch_fn: BatchFn<T, R> },
    /// Lane task is running
    Running { stop: oneshot::Sender<()> },
    Stopped,
}

/// Coalesces single submissions into batches for one batch function
pub struct BatchEngine<T, R> {
    config: BatchConfig,
    buffer: BatchBuffer<T, R>,
    trigger: Arc<FlushTrigger>,
    metrics: Arc<EngineMetrics>,
    lane: Mutex<Lane<T, R>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T, R> BatchEngine<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create an engine around a plain batch function.
    ///
    /// An error from `f` fails every entry of that batch.
    ///
    /// # Errors
    /// `PipelineError::Config` if `config` is invalid.
    pub fn new<F, E>(config: BatchConfig, f: F) -> PipelineResult<Self>
    where
        F: Fn(Vec<T>) -> Result<Vec<R>, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let batch_fn: BatchFn<T, R> = Arc::new(move |values: Vec<T>| {
            f(values)
                .map(|outputs| outputs.into_iter().map(Ok).collect())
                .map_err(|e| PipelineError::stage(0, e))
        });
        Self::with_item_results(config, batch_fn)
    }

    /// Create an engine around a batch function that reports per-item outcomes
    pub fn with_item_results(config: BatchConfig, batch_fn: BatchFn<T, R>) -> PipelineResult<Self> {
        config.validate()?;

        let (buffer, drain) = batch_buffer(config.buffer_capacity());
        let trigger = Arc::new(FlushTrigger::new(config.max_batch_size, config.batch_timeout));

        Ok(Self {
            config,
            buffer,
            trigger,
            metrics: Arc::new(EngineMetrics::new()),
            lane: Mutex::new(Lane::Ready { drain, batch_fn }),
            task: Mutex::new(None),
        })
    }

    /// Spawn the flush lane on `runtime`. Must be called exactly once.
    ///
    /// # Errors
    /// `PipelineError::Config` if the engine was already started or closed.
    pub fn start(&self, runtime: &Handle) -> PipelineResult<()> {
        let mut lane = self.lane.lock().unwrap_or_else(PoisonError::into_inner);

        let (drain, batch_fn) = match std::mem::replace(&mut *lane, Lane::Stopped) {
            Lane::Ready { drain, batch_fn } => (drain, batch_fn),
            other => {
                let message = match &other {
                    Lane::Running { .. } => "batch engine already started",
                    _ => "batch engine is shut down",
                };
                *lane = other;
                return Err(PipelineError::config(message));
            }
        };

        let (stop, stop_rx) = oneshot::channel();
        let flush_lane = FlushLane {
            drain,
            batch_fn,
            trigger: self.trigger.clone(),
            metrics: self.metrics.clone(),
            batch_size: self.config.max_batch_size,
        };
        let task = runtime.spawn(flush_lane.run(stop_rx));

        *lane = Lane::Running { stop };
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        debug!(
            batch_size = self.config.max_batch_size,
            timeout_ms = self.config.batch_timeout.as_millis() as u64,
            capacity = self.buffer.capacity(),
            "Batch engine started"
        );

        Ok(())
    }

    /// Submit a value, blocking while the buffer is full.
    ///
    /// A submission refused because the engine is closing returns a handle
    /// already failed with `Shutdown`.
    ///
    /// # Panics
    /// Panics if called from inside an async execution context; use
    /// [`submit_async`](Self::submit_async) there.
    pub fn submit(&self, value: T) -> ResultHandle<R> {
        let enqueued = self.buffer.enqueue(value);
        self.after_enqueue(enqueued)
    }

    /// Submit a value, waiting asynchronously while the buffer is full
    pub async fn submit_async(&self, value: T) -> ResultHandle<R> {
        let enqueued = self.buffer.enqueue_async(value).await;
        self.after_enqueue(enqueued)
    }

    fn after_enqueue(&self, enqueued: PipelineResult<ResultHandle<R>>) -> ResultHandle<R> {
        match enqueued {
            Ok(handle) => {
                let depth = self.buffer.depth();
                self.metrics.record_submitted(depth);
                let signalled = self.trigger.on_enqueue(depth);
                trace!(depth, signalled, "Entry enqueued");
                handle
            }
            Err(err) => {
                self.metrics.record_rejected();
                ResultHandle::ready(Err(err))
            }
        }
    }

    /// Stop the lane without waiting for it. Idempotent.
    ///
    /// Buffered entries are still flushed by the lane before it exits.
    pub fn close(&self) {
        let previous = {
            let mut lane = self.lane.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *lane, Lane::Stopped)
        };

        match previous {
            Lane::Ready { mut drain, .. } => {
                drain.close();
                let failed = drain.fail_all(&PipelineError::Shutdown);
                self.metrics.record_outcomes(0, failed);
                debug!(failed, "Batch engine closed before start");
            }
            Lane::Running { stop } => {
                let _ = stop.send(());
                debug!(pending = self.buffer.depth(), "Batch engine stopping");
            }
            Lane::Stopped => {}
        }
    }

    /// Close the engine and wait for the lane to drain
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Flush lane terminated abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.lane.lock().unwrap_or_else(PoisonError::into_inner),
            Lane::Running { .. }
        )
    }

    /// Entries currently waiting in the buffer
    pub fn depth(&self) -> usize {
        self.buffer.depth()
    }

    pub fn trigger_state(&self) -> TriggerState {
        self.trigger.state()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<T, R> Drop for BatchEngine<T, R> {
    fn drop(&mut self) {
        let lane = self.lane.get_mut().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(lane, Lane::Stopped) {
            Lane::Ready { mut drain, .. } => {
                drain.close();
                drain.fail_all(&PipelineError::Shutdown);
            }
            Lane::Running { stop } => {
                let _ = stop.send(());
            }
            Lane::Stopped => {}
        }
    }
}

/// Type-erased access used by pipelines holding engines of different item
/// types
pub(crate) trait EngineControl: Send + Sync {
    /// Submit and wait on the calling thread
    fn submit_value(&self, value: Value) -> PipelineResult<Value>;
    /// Submit and wait without holding a thread
    fn submit_value_async(
        self: Arc<Self>,
        value: Value,
    ) -> BoxFuture<'static, PipelineResult<Value>>;
    fn close(&self);
    fn take_task(&self) -> Option<JoinHandle<()>>;
    fn metrics(&self) -> MetricsSnapshot;
}

impl<T, R> EngineControl for BatchEngine<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn submit_value(&self, value: Value) -> PipelineResult<Value> {
        let input = downcast::<T>(value)?;
        BatchEngine::submit(self, input).wait().map(|out| Box::new(out) as Value)
    }

    fn submit_value_async(
        self: Arc<Self>,
        value: Value,
    ) -> BoxFuture<'static, PipelineResult<Value>> {
        async move {
            let input = downcast::<T>(value)?;
            let handle = BatchEngine::submit_async(&self, input).await;
            handle.await.map(|out| Box::new(out) as Value)
        }
        .boxed()
    }

    fn close(&self) {
        BatchEngine::close(self);
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn metrics(&self) -> MetricsSnapshot {
        BatchEngine::metrics(self)
    }
}

/// State owned by the lane task
struct FlushLane<T, R> {
    drain: BatchDrain<T, R>,
    batch_fn: BatchFn<T, R>,
    trigger: Arc<FlushTrigger>,
    metrics: Arc<EngineMetrics>,
    batch_size: usize,
}

impl<T, R> FlushLane<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = self.trigger.ticker();

        loop {
            // A dropped stop sender means the engine is gone: stop as well.
            let cause = tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = self.trigger.signalled() => FlushCause::Size,
                _ = ticker.tick() => FlushCause::Timer,
            };

            self.trigger.begin_flush();
            // A coalesced size signal may outlive the entries that raised it;
            // partial batches are left for the timer.
            if cause == FlushCause::Timer {
                self.flush(cause).await;
            }
            while self.drain.len() >= self.batch_size {
                self.flush(FlushCause::Size).await;
            }
            self.trigger.end_flush();
        }

        self.drain.close();
        let mut drained = 0;
        loop {
            let flushed = self.flush(FlushCause::Shutdown).await;
            if flushed == 0 {
                break;
            }
            drained += flushed;
        }
        debug!(drained, "Flush lane stopped");
    }

    /// Run one flush; returns the number of entries processed
    async fn flush(&mut self, cause: FlushCause) -> usize {
        let entries = self.drain.extract(self.batch_size);
        if entries.is_empty() {
            return 0;
        }

        let batch_size = entries.len();
        self.metrics.record_flush(batch_size, cause);
        debug!(batch_size, trigger = %cause, "Flushing batch");

        let (values, senders): (Vec<T>, Vec<ResultSender<R>>) =
            entries.into_iter().map(PendingEntry::split).unzip();

        let batch_fn = self.batch_fn.clone();
        let task = tokio::task::spawn_blocking(move || run_guarded(|| batch_fn(values)));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(PipelineError::aborted(format!("batch task failed: {e}"))),
        };

        self.deliver(senders, outcome);
        batch_size
    }

    fn deliver(
        &self,
        senders: Vec<ResultSender<R>>,
        outcome: PipelineResult<Vec<PipelineResult<R>>>,
    ) {
        let batch_size = senders.len();

        let results = match outcome {
            Ok(results) if results.len() == batch_size => results,
            Ok(results) => {
                let err = PipelineError::batch(format!(
                    "batch function returned {} outputs for {} inputs",
                    results.len(),
                    batch_size
                ));
                warn!(error = %err, "Output count mismatch");
                return self.fail_all(senders, err);
            }
            Err(err) => {
                warn!(batch_size, error = %err, "Batch failed");
                return self.fail_all(senders, err);
            }
        };

        let failed = results.iter().filter(|r| r.is_err()).count();
        self.metrics.record_outcomes(batch_size - failed, failed);

        for (sender, result) in senders.into_iter().zip(results) {
            // Ignore send errors (submitter stopped waiting)
            sender.resolve(result);
        }
    }

    fn fail_all(&self, senders: Vec<ResultSender<R>>, err: PipelineError) {
        self.metrics.record_batch_failure(senders.len());
        for sender in senders {
            sender.fail(err.clone());
        }
    }
}
