//! Fluent pipeline construction.
//!
//! [`PipelineBuilder`] composes direct per-item stages. [`batched`] opens a
//! [`BatchedBuilder`] segment; [`sequential`] closes it, fuses its stages,
//! starts a [`BatchEngine`] for it and hands back a `PipelineBuilder` whose
//! chain submits into that engine and waits for the item's own result.
//!
//! [`batched`]: PipelineBuilder::batched
//! [`sequential`]: BatchedBuilder::sequential

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::chain::Chain;
use crate::config::BatchConfig;
use crate::engine::{BatchEngine, BatchFn, EngineControl};
use crate::error::{BoxError, PipelineError, PipelineResult};
use crate::executor::WorkerPool;
use crate::pipeline::Pipeline;
use crate::fanout::ItemFn;
use crate::stage::{downcast, erase_item, ComposedBatch, Stage, Value};

/// Builder for a pipeline from `T` to `R`
pub struct PipelineBuilder<T, R> {
    pool: WorkerPool,
    chain: Chain,
    engines: Vec<Arc<dyn EngineControl>>,
    next_stage: usize,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> Clone for PipelineBuilder<T, R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            chain: self.chain.clone(),
            engines: self.engines.clone(),
            next_stage: self.next_stage,
            _marker: PhantomData,
        }
    }
}

impl<T> PipelineBuilder<T, T>
where
    T: Send + 'static,
{
    /// Identity pipeline on `pool`
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            chain: Chain::default(),
            engines: Vec::new(),
            next_stage: 0,
            _marker: PhantomData,
        }
    }
}

impl<T, R> PipelineBuilder<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn push_direct<U>(mut self, f: ItemFn<Value, Value>) -> PipelineBuilder<T, U> {
        self.chain.push_direct(f);
        PipelineBuilder {
            pool: self.pool,
            chain: self.chain,
            engines: self.engines,
            next_stage: self.next_stage + 1,
            _marker: PhantomData,
        }
    }

    /// Append a direct per-item stage
    pub fn map<U, F>(self, f: F) -> PipelineBuilder<T, U>
    where
        U: Send + 'static,
        F: Fn(R) -> U + Send + Sync + 'static,
    {
        self.push_direct(erase_item(move |input: R| Ok(f(input))))
    }

    /// Append a fallible direct per-item stage
    pub fn try_map<U, E, F>(self, f: F) -> PipelineBuilder<T, U>
    where
        U: Send + 'static,
        E: Into<BoxError>,
        F: Fn(R) -> Result<U, E> + Send + Sync + 'static,
    {
        let stage = self.next_stage;
        self.push_direct(erase_item(move |input: R| {
            f(input).map_err(|e| PipelineError::stage(stage, e))
        }))
    }

    /// Open a batched segment flushing at `max_batch_size` entries or every
    /// `timeout`, whichever comes first
    pub fn batched(self, max_batch_size: usize, timeout: Duration) -> BatchedBuilder<T, R, R> {
        self.batched_with(BatchConfig::new(max_batch_size, timeout))
    }

    /// Open a batched segment with a full engine configuration
    pub fn batched_with(self, config: BatchConfig) -> BatchedBuilder<T, R, R> {
        BatchedBuilder { parent: self, config, stages: Vec::new(), _marker: PhantomData }
    }

    pub fn build(self) -> Pipeline<T, R> {
        Pipeline::from_parts(self.pool, self.chain, self.engines)
    }
}

/// Builder for a batched segment taking `B` from the parent chain and
/// currently producing `U`
pub struct BatchedBuilder<T, B, U> {
    parent: PipelineBuilder<T, B>,
    config: BatchConfig,
    stages: Vec<Stage>,
    _marker: PhantomData<fn(B) -> U>,
}

impl<T, B, U> Clone for BatchedBuilder<T, B, U> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            config: self.config.clone(),
            stages: self.stages.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, B, U> BatchedBuilder<T, B, U>
where
    T: Send + 'static,
    B: Send + 'static,
    U: Send + 'static,
{
    fn push<V>(mut self, stage: Stage) -> BatchedBuilder<T, B, V> {
        self.stages.push(stage);
        self.parent.next_stage += 1;
        BatchedBuilder {
            parent: self.parent,
            config: self.config,
            stages: self.stages,
            _marker: PhantomData,
        }
    }

    /// Per-item stage, run concurrently across the batch on the worker pool.
    /// Adjacent per-item stages fuse into one fan-out.
    pub fn map<V, F>(self, f: F) -> BatchedBuilder<T, B, V>
    where
        V: Send + 'static,
        F: Fn(U) -> V + Send + Sync + 'static,
    {
        self.push(Stage::per_item(move |input: U| Ok(f(input))))
    }

    /// Fallible per-item stage. With the default item failure policy a
    /// failing item fails only its own caller.
    pub fn try_map<V, E, F>(self, f: F) -> BatchedBuilder<T, B, V>
    where
        V: Send + 'static,
        E: Into<BoxError>,
        F: Fn(U) -> Result<V, E> + Send + Sync + 'static,
    {
        let stage = self.parent.next_stage;
        self.push(Stage::per_item(move |input: U| {
            f(input).map_err(|e| PipelineError::stage(stage, e))
        }))
    }

    /// Per-batch stage seeing every live item of the batch at once.
    ///
    /// `f` must return one output per input, in order; a length mismatch fails
    /// the batch.
    pub fn map_batch<V, F>(self, f: F) -> BatchedBuilder<T, B, V>
    where
        V: Send + 'static,
        F: Fn(Vec<U>) -> Vec<V> + Send + Sync + 'static,
    {
        self.push(Stage::per_batch(move |inputs: Vec<U>| Ok(f(inputs))))
    }

    /// Fallible per-batch stage; an error reaches every item of the batch
    pub fn try_map_batch<V, E, F>(self, f: F) -> BatchedBuilder<T, B, V>
    where
        V: Send + 'static,
        E: Into<BoxError>,
        F: Fn(Vec<U>) -> Result<Vec<V>, E> + Send + Sync + 'static,
    {
        let stage = self.parent.next_stage;
        self.push(Stage::per_batch(move |inputs: Vec<U>| {
            f(inputs).map_err(|e| PipelineError::stage(stage, e))
        }))
    }

    /// Number of stages declared in this segment so far
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Close the segment: fuse its stages, start its engine and return to
    /// per-item composition.
    ///
    /// # Errors
    /// `PipelineError::Config` if no stage was declared or the batch
    /// configuration is invalid.
    pub fn sequential(self) -> PipelineResult<PipelineBuilder<T, U>> {
        if self.stages.is_empty() {
            return Err(PipelineError::config("batched() block must contain at least one stage"));
        }
        self.config.validate()?;

        let Self { parent, config, stages, .. } = self;
        let PipelineBuilder { pool, mut chain, mut engines, next_stage, .. } = parent;

        let declared = stages.len();
        let composed = ComposedBatch::new(stages, &pool, config.item_failure);
        debug!(
            stages = declared,
            steps = composed.step_count(),
            batch_size = config.max_batch_size,
            "Batched segment composed"
        );

        let batch_fn: BatchFn<B, U> = Arc::new(move |values: Vec<B>| {
            let inputs = values.into_iter().map(|v| Box::new(v) as Value).collect();
            let outputs = composed.apply(inputs)?;
            Ok(outputs.into_iter().map(|r| r.and_then(downcast::<U>)).collect())
        });

        let engine = Arc::new(BatchEngine::with_item_results(config, batch_fn)?);
        engine.start(pool.runtime())?;
        let engine: Arc<dyn EngineControl> = engine;
        chain.push_batched(engine.clone());
        engines.push(engine);

        Ok(PipelineBuilder { pool, chain, engines, next_stage, _marker: PhantomData })
    }
}
