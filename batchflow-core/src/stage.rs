//! Stage descriptors and build-time fusion.
//!
//! A batched segment is declared as a list of [`Stage`]s. Values flow through
//! it type-erased as [`Value`]; the typed constructors downcast on entry and
//! box on exit, so a mismatch surfaces as a `Batch` error rather than a panic.
//!
//! [`fuse`] reduces the stage list to [`Step`]s: every run of consecutive
//! per-item stages becomes one fan-out, every per-batch stage stays a barrier.
//!
//! ```text
//! map(f) map(g) map_batch(h) map(k)
//!   └─ FanOut(g∘f) ─┘  Batch(h)  FanOut(k)
//! ```

use std::any::{type_name, Any};
use std::sync::Arc;

use crate::config::ItemFailurePolicy;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::WorkerPool;
use crate::fanout::{FanOut, ItemFn};

/// A value travelling through a batched segment
pub(crate) type Value = Box<dyn Any + Send>;

type BatchStageFn = Arc<dyn Fn(Vec<Value>) -> PipelineResult<Vec<Value>> + Send + Sync>;

/// One declared stage of a batched segment
#[derive(Clone)]
pub(crate) enum Stage {
    /// Runs once per item; adjacent per-item stages fuse
    PerItem(ItemFn<Value, Value>),
    /// Sees the whole batch; never fused
    PerBatch(BatchStageFn),
}

impl Stage {
    pub(crate) fn per_item<A, B, F>(f: F) -> Self
    where
        A: 'static,
        B: Send + 'static,
        F: Fn(A) -> PipelineResult<B> + Send + Sync + 'static,
    {
        Stage::PerItem(erase_item(f))
    }

    /// `f` must return one output per input, in input order
    pub(crate) fn per_batch<A, B, F>(f: F) -> Self
    where
        A: 'static,
        B: Send + 'static,
        F: Fn(Vec<A>) -> PipelineResult<Vec<B>> + Send + Sync + 'static,
    {
        Stage::PerBatch(Arc::new(move |values: Vec<Value>| {
            let inputs = values.into_iter().map(downcast::<A>).collect::<PipelineResult<Vec<A>>>()?;
            let outputs = f(inputs)?;
            Ok(outputs.into_iter().map(|out| Box::new(out) as Value).collect())
        }))
    }
}

/// Wrap a typed per-item function to take and return [`Value`]s
pub(crate) fn erase_item<A, B, F>(f: F) -> ItemFn<Value, Value>
where
    A: 'static,
    B: Send + 'static,
    F: Fn(A) -> PipelineResult<B> + Send + Sync + 'static,
{
    Arc::new(move |value: Value| {
        let input = downcast::<A>(value)?;
        f(input).map(|out| Box::new(out) as Value)
    })
}

pub(crate) fn downcast<A: 'static>(value: Value) -> PipelineResult<A> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| PipelineError::batch(format!("stage input is not a `{}`", type_name::<A>())))
}

/// A fused execution step
pub(crate) enum Step {
    FanOut(FanOut<Value, Value>),
    Batch(BatchStageFn),
}

/// Greedily merge consecutive per-item stages into single fan-outs
pub(crate) fn fuse(stages: Vec<Stage>, pool: &WorkerPool) -> Vec<Step> {
    let mut steps: Vec<Step> = Vec::with_capacity(stages.len());

    for stage in stages {
        match stage {
            Stage::PerItem(g) => match steps.pop() {
                Some(Step::FanOut(fan)) => steps.push(Step::FanOut(fan.then(move |v| g(v)))),
                last => {
                    steps.extend(last);
                    steps.push(Step::FanOut(FanOut::from_arc(pool.clone(), g)));
                }
            },
            Stage::PerBatch(f) => steps.push(Step::Batch(f)),
        }
    }

    steps
}

/// The batch function of a batched segment: fused steps run in order
pub(crate) struct ComposedBatch {
    steps: Vec<Step>,
    policy: ItemFailurePolicy,
}

impl ComposedBatch {
    pub(crate) fn new(stages: Vec<Stage>, pool: &WorkerPool, policy: ItemFailurePolicy) -> Self {
        Self { steps: fuse(stages, pool), policy }
    }

    pub(crate) fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Run every step over `inputs`.
    ///
    /// Items that failed skip the remaining steps. Under `FailBatch` the first
    /// item failure is returned for the whole batch instead.
    pub(crate) fn apply(&self, inputs: Vec<Value>) -> PipelineResult<Vec<PipelineResult<Value>>> {
        let mut slots: Vec<PipelineResult<Value>> = inputs.into_iter().map(Ok).collect();

        for step in &self.steps {
            let (layout, live) = split_live(slots);
            if live.is_empty() {
                slots = merge(layout, Vec::new());
                break;
            }

            let count = live.len();
            let outputs = match step {
                Step::FanOut(fan) => fan.run(live),
                Step::Batch(f) => match f(live) {
                    Ok(outputs) if outputs.len() == count => outputs.into_iter().map(Ok).collect(),
                    Ok(outputs) => {
                        return Err(PipelineError::batch(format!(
                            "per-batch stage returned {} outputs for {} inputs",
                            outputs.len(),
                            count
                        )))
                    }
                    Err(err) if self.policy == ItemFailurePolicy::FailBatch => return Err(err),
                    Err(err) => (0..count).map(|_| Err(err.clone())).collect(),
                },
            };

            slots = merge(layout, outputs);

            if self.policy == ItemFailurePolicy::FailBatch {
                if let Some(Err(err)) = slots.iter().find(|slot| slot.is_err()) {
                    return Err(err.clone());
                }
            }
        }

        Ok(slots)
    }
}

/// Split slots into a layout (`None` marks a live item) and the live values
fn split_live(slots: Vec<PipelineResult<Value>>) -> (Vec<Option<PipelineError>>, Vec<Value>) {
    let mut layout = Vec::with_capacity(slots.len());
    let mut live = Vec::with_capacity(slots.len());

    for slot in slots {
        match slot {
            Ok(value) => {
                layout.push(None);
                live.push(value);
            }
            Err(err) => layout.push(Some(err)),
        }
    }

    (layout, live)
}

fn merge(
    layout: Vec<Option<PipelineError>>,
    outputs: Vec<PipelineResult<Value>>,
) -> Vec<PipelineResult<Value>> {
    let mut outputs = outputs.into_iter();
    layout
        .into_iter()
        .map(|failed| match failed {
            Some(err) => Err(err),
            None => outputs.next().unwrap_or(Err(PipelineError::batch("missing stage output"))),
        })
        .collect()
}
