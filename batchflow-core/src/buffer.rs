//! Bounded FIFO of pending entries.
//!
//! The buffer is split in two halves:
//!
//! - [`BatchBuffer`] is cloned into every submitter. `enqueue` appends an
//!   entry and blocks while the buffer is full.
//! - [`BatchDrain`] is owned by exactly one flush lane and is the only way to
//!   extract entries, so two extractions can never overlap.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{PipelineError, PipelineResult};
use crate::handle::{result_channel, ResultHandle, ResultSender};

/// A submitted value paired with the sender that resolves its handle
#[derive(Debug)]
pub struct PendingEntry<T, R> {
    value: T,
    sender: ResultSender<R>,
}

impl<T, R> PendingEntry<T, R> {
    fn new(value: T) -> (Self, ResultHandle<R>) {
        let (sender, handle) = result_channel();
        (Self { value, sender }, handle)
    }

    /// The submitted value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Resolve this entry's handle, consuming the entry.
    /// Returns false if the submitter stopped waiting.
    pub fn resolve(self, result: PipelineResult<R>) -> bool {
        self.sender.resolve(result)
    }

    pub(crate) fn split(self) -> (T, ResultSender<R>) {
        (self.value, self.sender)
    }
}

/// Create a buffer holding at most `capacity` entries
pub fn batch_buffer<T, R>(capacity: usize) -> (BatchBuffer<T, R>, BatchDrain<T, R>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BatchBuffer { tx }, BatchDrain { rx })
}

/// Submission half of the buffer
#[derive(Debug)]
pub struct BatchBuffer<T, R> {
    tx: mpsc::Sender<PendingEntry<T, R>>,
}

impl<T, R> Clone for BatchBuffer<T, R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T, R> BatchBuffer<T, R> {
    /// Append a value, blocking the current thread while the buffer is full.
    ///
    /// # Errors
    /// `PipelineError::Shutdown` if the drain side has been closed or dropped.
    ///
    /// # Panics
    /// Panics if called from inside an async execution context; use
    /// [`enqueue_async`](Self::enqueue_async) there.
    pub fn enqueue(&self, value: T) -> PipelineResult<ResultHandle<R>> {
        let (entry, handle) = PendingEntry::new(value);
        self.tx.blocking_send(entry).map_err(|_| PipelineError::Shutdown)?;
        Ok(handle)
    }

    /// Append a value, waiting asynchronously while the buffer is full
    pub async fn enqueue_async(&self, value: T) -> PipelineResult<ResultHandle<R>> {
        let (entry, handle) = PendingEntry::new(value);
        self.tx.send(entry).await.map_err(|_| PipelineError::Shutdown)?;
        Ok(handle)
    }

    /// Number of entries currently waiting (including reserved slots)
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Maximum number of entries the buffer holds
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Whether the drain side has been closed
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Extraction half of the buffer
#[derive(Debug)]
pub struct BatchDrain<T, R> {
    rx: mpsc::Receiver<PendingEntry<T, R>>,
}

impl<T, R> BatchDrain<T, R> {
    /// Remove up to `max_count` of the oldest entries, in arrival order.
    ///
    /// Never waits; returns an empty vector when nothing is buffered.
    pub fn extract(&mut self, max_count: usize) -> Vec<PendingEntry<T, R>> {
        let mut out = Vec::with_capacity(max_count.min(self.rx.len()));

        while out.len() < max_count {
            match self.rx.try_recv() {
                Ok(entry) => out.push(entry),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        out
    }

    /// Stop accepting new entries. Entries already buffered stay extractable;
    /// submitters blocked on a full buffer are released with `Shutdown`.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Fail every buffered entry with `err`, returning how many were failed
    pub fn fail_all(&mut self, err: &PipelineError) -> usize {
        let mut failed = 0;
        loop {
            let entries = self.extract(usize::MAX);
            if entries.is_empty() {
                return failed;
            }
            for entry in entries {
                entry.resolve(Err(err.clone()));
                failed += 1;
            }
        }
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
