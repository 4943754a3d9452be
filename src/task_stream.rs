//! Strict-FIFO serializer for asynchronous work units
//!
//! A [`TaskStream`] runs enqueued units one at a time in enqueue order; unit
//! *n+1* does not start until unit *n* has fully completed, including every
//! continuation it awaits. Each `queue*` call returns a [`QueuedTask`]
//! future for that unit's result.
//!
//! A single worker task drains the queue. It is spawned on the first enqueue
//! and exits when the queue empties; the running flag flips inside the same
//! critical section as the emptiness check, so an enqueue racing the
//! worker's exit either hands the unit to the live worker or spawns a fresh
//! one — a unit can never be stranded.
//!
//! Failure is contained per unit: a panicking unit fails its own
//! [`QueuedTask`] with [`Error::Faulted`] and the stream moves on.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_coord::TaskStream;
//!
//! # async fn example() {
//! let stream = TaskStream::new();
//!
//! let first = stream.queue(|| 1);
//! let second = stream.queue_async(|| async { 2 });
//!
//! assert_eq!(first.await.unwrap(), 1);
//! assert_eq!(second.await.unwrap(), 2);
//!
//! stream.complete().await; // drain, then refuse further work
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::cancellation::CancellationToken;
use crate::error::Error;
use crate::latch::Latch;

/// A queued unit, erased to its side effects; results travel through the
/// oneshot captured inside.
type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()>>;

/// Single-consumer strict-FIFO task serializer.
///
/// Clones share the same stream. The handle is tied to the thread's compio
/// runtime: the internal worker is spawned with `compio::runtime::spawn`.
#[derive(Clone)]
pub struct TaskStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    state: Mutex<StreamState>,
    drained: Latch,
}

struct StreamState {
    queue: VecDeque<Job>,
    /// A worker task currently owns the queue head.
    running: bool,
    /// `complete()` was called; no further enqueues.
    completing: bool,
}

impl TaskStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    queue: VecDeque::new(),
                    running: false,
                    completing: false,
                }),
                drained: Latch::new(),
            }),
        }
    }

    /// Enqueue a synchronous unit; resolves to its return value.
    pub fn queue<F, R>(&self, work: F) -> QueuedTask<R>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        self.submit(None, move || {
            async move { catch_unwind(AssertUnwindSafe(work)).map_err(|_| Error::Faulted) }
                .boxed_local()
        })
    }

    /// Enqueue a synchronous unit taking an input value.
    pub fn queue_with<T, F, R>(&self, value: T, work: F) -> QueuedTask<R>
    where
        T: 'static,
        F: FnOnce(T) -> R + 'static,
        R: 'static,
    {
        self.queue(move || work(value))
    }

    /// Enqueue an asynchronous unit; the stream awaits the returned future
    /// to completion before starting the next unit.
    pub fn queue_async<F, Fut, R>(&self, work: F) -> QueuedTask<R>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = R> + 'static,
        R: 'static,
    {
        self.submit(None, move || {
            AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .map(|result| result.map_err(|_| Error::Faulted))
                .boxed_local()
        })
    }

    /// Enqueue an asynchronous unit taking an input value.
    pub fn queue_async_with<T, F, Fut, R>(&self, value: T, work: F) -> QueuedTask<R>
    where
        T: 'static,
        F: FnOnce(T) -> Fut + 'static,
        Fut: Future<Output = R> + 'static,
        R: 'static,
    {
        self.queue_async(move || work(value))
    }

    /// Enqueue a synchronous unit that is skipped if `token` has fired by
    /// the time the unit reaches the head of the stream.
    ///
    /// A skipped unit fails with [`Error::Cancelled`] and does not delay its
    /// successor. A unit already running when the token fires runs to
    /// completion; cancellation is then observable only inside the work.
    pub fn queue_cancellable<F, R>(&self, work: F, token: &CancellationToken) -> QueuedTask<R>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        self.submit(Some(token.clone()), move || {
            async move { catch_unwind(AssertUnwindSafe(work)).map_err(|_| Error::Faulted) }
                .boxed_local()
        })
    }

    /// Asynchronous form of [`TaskStream::queue_cancellable`].
    pub fn queue_async_cancellable<F, Fut, R>(
        &self,
        work: F,
        token: &CancellationToken,
    ) -> QueuedTask<R>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = R> + 'static,
        R: 'static,
    {
        self.submit(Some(token.clone()), move || {
            AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .map(|result| result.map_err(|_| Error::Faulted))
                .boxed_local()
        })
    }

    /// Stop accepting work and wait for the queue to drain.
    ///
    /// Units already enqueued run to completion; later `queue*` calls return
    /// tasks that fail with [`Error::Closed`]. Idempotent.
    pub async fn complete(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.completing = true;
            !state.running && state.queue.is_empty()
        };
        if drained {
            self.inner.drained.set();
        }
        self.inner.drained.wait().await;
    }

    /// Approximate number of unfinished units, including the running one.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        let state = self.inner.state.lock();
        state.queue.len() + usize::from(state.running)
    }

    /// Whether [`TaskStream::complete`] has been called.
    #[must_use]
    pub fn is_completing(&self) -> bool {
        self.inner.state.lock().completing
    }

    fn submit<R, F>(&self, token: Option<CancellationToken>, run: F) -> QueuedTask<R>
    where
        R: 'static,
        F: FnOnce() -> LocalBoxFuture<'static, Result<R, Error>> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let skip = token.as_ref().is_some_and(CancellationToken::is_cancelled);
                let outcome = if skip {
                    Err(Error::Cancelled)
                } else {
                    run().await
                };
                // The receiver may have been dropped; the unit ran anyway.
                let _ = tx.send(outcome);
            }
            .boxed_local()
        });

        let spawn = {
            let mut state = self.inner.state.lock();
            if state.completing {
                return QueuedTask {
                    state: TaskState::Rejected,
                };
            }
            state.queue.push_back(job);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if spawn {
            self.spawn_worker();
        }
        QueuedTask {
            state: TaskState::Waiting(rx),
        }
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        compio::runtime::spawn(async move {
            loop {
                let job = {
                    let mut state = inner.state.lock();
                    match state.queue.pop_front() {
                        Some(job) => job,
                        None => {
                            state.running = false;
                            let drained = state.completing;
                            drop(state);
                            if drained {
                                inner.drained.set();
                            }
                            return;
                        }
                    }
                };
                // Await the unit to full completion before touching the
                // queue again; this is the whole ordering guarantee.
                job().await;
            }
        })
        .detach();
    }
}

impl Default for TaskStream {
    fn default() -> Self {
        Self::new()
    }
}

enum TaskState<R> {
    /// Enqueued after `complete()`; fails on first poll.
    Rejected,
    Waiting(oneshot::Receiver<Result<R, Error>>),
}

/// Future for one queued unit's result.
///
/// Dropping it does not unqueue the unit — the stream runs it regardless —
/// it only discards the result. Use [`TaskStream::queue_cancellable`] to
/// skip units that have not started yet.
pub struct QueuedTask<R> {
    state: TaskState<R>,
}

impl<R> Future for QueuedTask<R> {
    type Output = Result<R, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            TaskState::Rejected => Poll::Ready(Err(Error::Closed)),
            TaskState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                // Sender dropped without sending: the stream was dropped
                // with the unit still queued.
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn test_queue_returns_result() {
        let stream = TaskStream::new();
        let result = stream.queue(|| 41 + 1).await;
        assert_eq!(result, Ok(42));
    }

    #[compio::test]
    async fn test_queue_async_returns_result() {
        let stream = TaskStream::new();
        let result = stream.queue_async(|| async { "done" }).await;
        assert_eq!(result, Ok("done"));
    }

    #[compio::test]
    async fn test_queue_with_passes_value() {
        let stream = TaskStream::new();
        let result = stream.queue_with(20, |n| n * 2).await;
        assert_eq!(result, Ok(40));
    }

    #[compio::test]
    async fn test_complete_rejects_further_work() {
        let stream = TaskStream::new();
        stream.complete().await;
        assert!(stream.is_completing());
        let result = stream.queue(|| 1).await;
        assert_eq!(result, Err(Error::Closed));
    }

    #[compio::test]
    async fn test_pending_actions_drains_to_zero() {
        let stream = TaskStream::new();
        let task = stream.queue(|| ());
        task.await.unwrap();
        stream.complete().await;
        assert_eq!(stream.pending_actions(), 0);
    }
}
