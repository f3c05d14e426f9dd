//! The per-item path of a built pipeline.
//!
//! A [`Chain`] is a list of segments. Consecutive direct stages fuse into one
//! [`Segment::Direct`] function; every batched block is a
//! [`Segment::Batched`] engine.
//!
//! ```text
//! map(f) map(g) batched{..}.sequential() map(k)
//!  └─ Direct(g∘f) ─┘  Batched(engine)     Direct(k)
//! ```
//!
//! [`Chain::run`] drives an item on the calling thread. [`Chain::run_async`]
//! runs direct segments on blocking threads and awaits batched segments, so
//! an item waiting for its batch holds no thread at all.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::engine::EngineControl;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::run_guarded;
use crate::fanout::ItemFn;
use crate::stage::Value;

#[derive(Clone)]
pub(crate) enum Segment {
    Direct(ItemFn<Value, Value>),
    Batched(Arc<dyn EngineControl>),
}

#[derive(Clone, Default)]
pub(crate) struct Chain {
    segments: Vec<Segment>,
}

impl Chain {
    /// Append a direct stage, fusing it with a preceding direct segment
    pub(crate) fn push_direct(&mut self, g: ItemFn<Value, Value>) {
        match self.segments.pop() {
            Some(Segment::Direct(f)) => {
                self.segments.push(Segment::Direct(Arc::new(move |v: Value| f(v).and_then(&*g))))
            }
            last => {
                self.segments.extend(last);
                self.segments.push(Segment::Direct(g));
            }
        }
    }

    pub(crate) fn push_batched(&mut self, engine: Arc<dyn EngineControl>) {
        self.segments.push(Segment::Batched(engine));
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Drive `value` through every segment on the calling thread
    pub(crate) fn run(&self, value: Value) -> PipelineResult<Value> {
        self.segments.iter().try_fold(value, |value, segment| match segment {
            Segment::Direct(f) => f(value),
            Segment::Batched(engine) => engine.submit_value(value),
        })
    }

    /// Drive `value` through every segment from an async task.
    ///
    /// Direct segments run on a blocking thread of `runtime` and give it
    /// back as soon as they return.
    pub(crate) async fn run_async(
        &self,
        runtime: &Handle,
        mut value: Value,
    ) -> PipelineResult<Value> {
        for segment in &self.segments {
            value = match segment {
                Segment::Direct(f) => {
                    let f = f.clone();
                    runtime
                        .spawn_blocking(move || run_guarded(|| f(value)))
                        .await
                        .unwrap_or_else(|e| {
                            Err(PipelineError::aborted(format!("stage task failed: {e}")))
                        })?
                }
                Segment::Batched(engine) => engine.clone().submit_value_async(value).await?,
            };
        }
        Ok(value)
    }
}
