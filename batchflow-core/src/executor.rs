//! Worker pools for fan-out execution.
//!
//! A [`WorkerPool`] is an explicit resource handed to the pipeline builder.
//! It pairs the tokio runtime that hosts flush lanes with an [`Executor`]
//! that runs per-item jobs.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::{PipelineError, PipelineResult};
use crate::handle::{result_channel, ResultHandle};

/// A unit of blocking work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere off the calling thread
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// One blocking task per job, no fixed concurrency bound.
///
/// Suited to latency-bound item work (remote calls, inference requests).
#[derive(Debug, Clone)]
pub struct TaskPerItemExecutor {
    runtime: Handle,
}

impl TaskPerItemExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for TaskPerItemExecutor {
    fn execute(&self, job: Job) {
        self.runtime.spawn_blocking(job);
    }
}

/// At most `max_concurrent` jobs run at once; the rest wait for a permit
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BoundedExecutor {
    pub fn new(runtime: Handle, max_concurrent: usize) -> PipelineResult<Self> {
        if max_concurrent == 0 {
            return Err(PipelineError::config("max_concurrent must be > 0"));
        }
        Ok(Self { runtime, permits: Arc::new(Semaphore::new(max_concurrent)), max_concurrent })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Get number of available permits
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Executor for BoundedExecutor {
    fn execute(&self, job: Job) {
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            // A closed semaphore drops the job; its result handle reports Dropped.
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job();
            });
        });
    }
}

/// Runtime handle plus the executor used for per-item fan-out
#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    executor: Arc<dyn Executor>,
}

impl WorkerPool {
    /// Unbounded pool on the given runtime
    pub fn new(runtime: Handle) -> Self {
        let executor = TaskPerItemExecutor::new(runtime.clone());
        Self { runtime, executor: Arc::new(executor) }
    }

    /// Unbounded pool on the runtime of the current context.
    ///
    /// # Errors
    /// `PipelineError::Config` when called outside a tokio runtime.
    pub fn current() -> PipelineResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| PipelineError::config(format!("no tokio runtime available: {e}")))?;
        Ok(Self::new(runtime))
    }

    /// Pool running at most `max_concurrent` item jobs at once
    pub fn bounded(runtime: Handle, max_concurrent: usize) -> PipelineResult<Self> {
        let executor = BoundedExecutor::new(runtime.clone(), max_concurrent)?;
        Ok(Self { runtime, executor: Arc::new(executor) })
    }

    /// Pool with a caller-supplied executor
    pub fn with_executor(runtime: Handle, executor: impl Executor) -> Self {
        Self { runtime, executor: Arc::new(executor) }
    }

    /// Runtime hosting flush lanes and blocking work
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn execute(&self, job: Job) {
        self.executor.execute(job);
    }

    /// Run `f` on the executor and return a handle to its result.
    ///
    /// A panic inside `f` resolves the handle with `TaskAborted`.
    pub fn spawn_result<R, F>(&self, f: F) -> ResultHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> PipelineResult<R> + Send + 'static,
    {
        let (tx, handle) = result_channel();
        self.execute(Box::new(move || {
            tx.resolve(run_guarded(f));
        }));
        handle
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

/// Run `f`, converting a panic into `TaskAborted`
pub(crate) fn run_guarded<R>(f: impl FnOnce() -> PipelineResult<R>) -> PipelineResult<R> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(PipelineError::aborted(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("stage panicked: {msg}")
    } else {
        "stage panicked".to_string()
    }
}
