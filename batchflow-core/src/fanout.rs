//! Concurrent per-item execution.
//!
//! [`FanOut`] submits one job per input to a [`WorkerPool`] and waits for all
//! of them, returning outputs at their input's index. Two fan-outs declared
//! back to back fuse with [`FanOut::then`]: N inputs cost N jobs instead of
//! 2N, and one barrier instead of two.

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::executor::WorkerPool;
use crate::handle::ResultHandle;

/// Per-item transformation shared by every job of a fan-out
pub type ItemFn<A, B> = Arc<dyn Fn(A) -> PipelineResult<B> + Send + Sync>;

/// A per-item transformation bound to a worker pool
pub struct FanOut<A, B> {
    pool: WorkerPool,
    f: ItemFn<A, B>,
}

impl<A, B> Clone for FanOut<A, B> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), f: self.f.clone() }
    }
}

impl<A, B> FanOut<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    pub fn new<F>(pool: WorkerPool, f: F) -> Self
    where
        F: Fn(A) -> PipelineResult<B> + Send + Sync + 'static,
    {
        Self { pool, f: Arc::new(f) }
    }

    pub(crate) fn from_arc(pool: WorkerPool, f: ItemFn<A, B>) -> Self {
        Self { pool, f }
    }

    /// Fuse `g` after this transformation into a single fan-out of `g∘f`
    pub fn then<C, G>(self, g: G) -> FanOut<A, C>
    where
        C: Send + 'static,
        G: Fn(B) -> PipelineResult<C> + Send + Sync + 'static,
    {
        let f = self.f;
        FanOut { pool: self.pool, f: Arc::new(move |a: A| f(a).and_then(&g)) }
    }

    /// Run every input concurrently and wait for all of them.
    ///
    /// Each output carries its own outcome, in input order. Blocks the
    /// calling thread; call it from a blocking context.
    pub fn run(&self, inputs: Vec<A>) -> Vec<PipelineResult<B>> {
        let handles: Vec<ResultHandle<B>> = inputs
            .into_iter()
            .map(|input| {
                let f = self.f.clone();
                self.pool.spawn_result(move || f(input))
            })
            .collect();

        handles.into_iter().map(ResultHandle::wait).collect()
    }

    /// Like [`run`](Self::run), but the first failing item (in input order)
    /// fails the whole call once every job has finished
    pub fn run_all(&self, inputs: Vec<A>) -> PipelineResult<Vec<B>> {
        self.run(inputs).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::time::Duration;

    async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_preserves_order() {
        let pool = WorkerPool::current().unwrap();
        // Later items finish first
        let fan = FanOut::new(pool, |n: u64| {
            std::thread::sleep(Duration::from_millis(40 - n * 10));
            Ok(n * n)
        });

        let outputs = blocking(move || fan.run_all(vec![0, 1, 2, 3])).await.unwrap();
        assert_eq!(outputs, vec![0, 1, 4, 9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_then_fuses_functions() {
        let pool = WorkerPool::current().unwrap();
        let fused = FanOut::new(pool.clone(), |s: String| Ok(s.len()))
            .then(|n: usize| Ok(format!("{n:b}")));

        let unfused_first = FanOut::new(pool.clone(), |s: String| Ok(s.len()));
        let unfused_second = FanOut::new(pool, |n: usize| Ok(format!("{n:b}")));

        let inputs: Vec<String> =
            ["1", "11", "111", "1111"].iter().map(|s| s.to_string()).collect();
        let (fused_out, unfused_out) = blocking(move || {
            let fused_out = fused.run_all(inputs.clone()).unwrap();
            let mid = unfused_first.run_all(inputs).unwrap();
            (fused_out, unfused_second.run_all(mid).unwrap())
        })
        .await;

        assert_eq!(fused_out, vec!["1", "10", "11", "100"]);
        assert_eq!(fused_out, unfused_out);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_item_failures_are_per_item() {
        let pool = WorkerPool::current().unwrap();
        let fan = FanOut::new(pool, |n: i32| {
            if n < 0 {
                Err(PipelineError::stage(0, "negative input"))
            } else {
                Ok(n + 1)
            }
        });

        let (each, all) = blocking(move || {
            let each = fan.run(vec![1, -1, 2]);
            let all = fan.run_all(vec![1, -1, 2]);
            (each, all)
        })
        .await;

        assert_eq!(*each[0].as_ref().unwrap(), 2);
        assert!(each[1].is_err());
        assert_eq!(*each[2].as_ref().unwrap(), 3);
        assert!(all.unwrap_err().to_string().contains("negative input"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_input() {
        let pool = WorkerPool::current().unwrap();
        let fan = FanOut::new(pool, |n: u8| Ok(n));
        assert!(blocking(move || fan.run(Vec::new())).await.is_empty());
    }
}
