//! The caller-facing pipeline handle.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::builder::PipelineBuilder;
use crate::chain::Chain;
use crate::engine::EngineControl;
use crate::error::PipelineResult;
use crate::executor::{run_guarded, WorkerPool};
use crate::handle::{result_channel, ResultHandle};
use crate::metrics::MetricsSnapshot;
use crate::stage::{downcast, Value};

/// A built pipeline from `T` to `R`.
///
/// Cheap to clone; every clone submits into the same batch engines. Dropping
/// the last clone closes them.
pub struct Pipeline<T, R = T> {
    inner: Arc<PipelineInner<T, R>>,
}

struct PipelineInner<T, R> {
    pool: WorkerPool,
    chain: Arc<Chain>,
    engines: Vec<Arc<dyn EngineControl>>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> Clone for Pipeline<T, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Pipeline<T, T>
where
    T: Send + 'static,
{
    /// Start building a pipeline on `pool`
    pub fn builder(pool: WorkerPool) -> PipelineBuilder<T, T> {
        PipelineBuilder::new(pool)
    }
}

impl<T, R> Pipeline<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn from_parts(
        pool: WorkerPool,
        chain: Chain,
        engines: Vec<Arc<dyn EngineControl>>,
    ) -> Self {
        debug!(segments = chain.segment_count(), engines = engines.len(), "Pipeline built");
        let chain = Arc::new(chain);
        Self {
            inner: Arc::new(PipelineInner { pool, chain, engines, _marker: PhantomData }),
        }
    }

    /// Run `value` through the pipeline on a task of the pool's runtime.
    ///
    /// Never blocks the caller. Direct stages run on blocking threads; an
    /// item waiting in a batch holds no thread. A stage panic resolves the
    /// handle with `TaskAborted`.
    pub fn submit(&self, value: T) -> ResultHandle<R> {
        let (tx, handle) = result_channel();
        let chain = self.inner.chain.clone();
        let runtime = self.inner.pool.runtime().clone();
        self.inner.pool.runtime().spawn(async move {
            let result = chain.run_async(&runtime, Box::new(value)).await;
            tx.resolve(result.and_then(downcast::<R>));
        });
        handle
    }

    /// Run `value` through the pipeline on the calling thread.
    ///
    /// Blocks until every stage, including any batched segment, has
    /// produced this item's result.
    ///
    /// # Panics
    /// Panics if the pipeline has a batched segment and this is called from
    /// inside an async execution context; use [`submit`](Self::submit) there.
    pub fn call(&self, value: T) -> PipelineResult<R> {
        run_guarded(|| self.inner.chain.run(Box::new(value) as Value).and_then(downcast::<R>))
    }

    /// Signal every batch engine to stop. Idempotent and non-blocking;
    /// buffered entries are still flushed.
    pub fn close(&self) {
        for engine in &self.inner.engines {
            engine.close();
        }
    }

    /// Close every batch engine and wait for their lanes to drain
    pub async fn shutdown(&self) {
        self.close();
        for engine in &self.inner.engines {
            if let Some(task) = engine.take_task() {
                if let Err(e) = task.await {
                    warn!(error = %e, "Flush lane terminated abnormally");
                }
            }
        }
        debug!(engines = self.inner.engines.len(), "Pipeline shut down");
    }

    /// One snapshot per batched segment, in declaration order
    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.inner.engines.iter().map(|engine| engine.metrics()).collect()
    }

    /// Number of batched segments in this pipeline
    pub fn batch_stage_count(&self) -> usize {
        self.inner.engines.len()
    }
}

impl<T, R> Drop for PipelineInner<T, R> {
    fn drop(&mut self) {
        for engine in &self.engines {
            engine.close();
        }
    }
}
