//! Single-assignment result handles.
//!
//! Each submission gets a [`ResultHandle`]; the engine keeps the matching
//! [`ResultSender`] inside the pending entry and consumes it exactly once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::error::{PipelineError, PipelineResult};

/// Create a connected sender/handle pair
pub(crate) fn result_channel<R>() -> (ResultSender<R>, ResultHandle<R>) {
    let (tx, rx) = oneshot::channel();
    (ResultSender { tx }, ResultHandle { rx })
}

/// Write side of a result handle. Consumed by the single resolution.
#[derive(Debug)]
pub(crate) struct ResultSender<R> {
    tx: oneshot::Sender<PipelineResult<R>>,
}

impl<R> ResultSender<R> {
    /// Resolve the handle. Returns false if the caller already dropped it.
    pub(crate) fn resolve(self, result: PipelineResult<R>) -> bool {
        self.tx.send(result).is_ok()
    }

    pub(crate) fn fail(self, err: PipelineError) -> bool {
        self.resolve(Err(err))
    }
}

/// Eventual output of one submission.
///
/// `.await` it from async code, [`wait`](Self::wait) on it from a blocking
/// thread, or poll it with [`try_result`](Self::try_result). Use
/// [`shared`](Self::shared) when several observers need the same outcome.
#[derive(Debug)]
pub struct ResultHandle<R> {
    rx: oneshot::Receiver<PipelineResult<R>>,
}

impl<R> ResultHandle<R> {
    /// A handle that is already resolved
    pub fn ready(result: PipelineResult<R>) -> Self {
        let (tx, handle) = result_channel();
        tx.resolve(result);
        handle
    }

    /// Block the current thread until the result is available.
    ///
    /// # Panics
    /// Panics if called from inside an async execution context; await the
    /// handle there instead.
    pub fn wait(self) -> PipelineResult<R> {
        self.rx.blocking_recv().unwrap_or(Err(PipelineError::Dropped))
    }

    /// Take the result if it is available, without blocking.
    ///
    /// Returns `None` while pending. Once a result has been returned the
    /// handle is spent and later calls report [`PipelineError::Dropped`].
    pub fn try_result(&mut self) -> Option<PipelineResult<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PipelineError::Dropped)),
        }
    }

    /// Convert into a cloneable future observed by any number of callers
    pub fn shared(self) -> Shared<Self>
    where
        R: Clone,
    {
        FutureExt::shared(self)
    }
}

impl<R> Future for ResultHandle<R> {
    type Output = PipelineResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PipelineError::Dropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_value() {
        let (tx, handle) = result_channel();
        assert!(tx.resolve(Ok(42)));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_dropped_sender_reports_dropped() {
        let (tx, handle) = result_channel::<u32>();
        drop(tx);
        assert!(matches!(handle.wait(), Err(PipelineError::Dropped)));
    }

    #[test]
    fn test_resolve_after_handle_dropped() {
        let (tx, handle) = result_channel::<u32>();
        drop(handle);
        assert!(!tx.resolve(Ok(1)));
    }

    #[test]
    fn test_try_result() {
        let (tx, mut handle) = result_channel::<&str>();
        assert!(handle.try_result().is_none());

        tx.fail(PipelineError::Shutdown);
        assert!(matches!(handle.try_result(), Some(Err(PipelineError::Shutdown))));
        assert!(matches!(handle.try_result(), Some(Err(PipelineError::Dropped))));
    }

    #[tokio::test]
    async fn test_await_handle() {
        let (tx, handle) = result_channel();
        tokio::spawn(async move {
            tx.resolve(Ok("done".to_string()));
        });
        assert_eq!(handle.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_shared_handle_observers() {
        let (tx, handle) = result_channel::<u64>();
        let shared = handle.shared();
        let first = shared.clone();
        let second = shared.clone();

        tx.resolve(Ok(7));

        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(shared.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let handle = ResultHandle::<u8>::ready(Err(PipelineError::Shutdown));
        assert!(matches!(handle.await, Err(PipelineError::Shutdown)));
    }
}
