//! Coalescing "pending work" flag
//!
//! A [`TaskFlag`] turns a burst of "something needs doing" notifications into
//! the minimum number of callback runs: at any instant at most one run is in
//! progress and at most one more is queued. N [`TaskFlag::set`] calls during
//! a run produce exactly one follow-up run.
//!
//! The pending bit is cleared just before the callback starts, so a `set`
//! that lands mid-run is never lost — the runner loops once more. With a
//! configured delay the runner sleeps before each run, absorbing further
//! `set`s for free.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_coord::TaskFlag;
//!
//! # async fn example() {
//! let flag = TaskFlag::new(|| async {
//!     // flush dirty state, poke a downstream service, ...
//! });
//!
//! flag.set().unwrap();
//! flag.set().unwrap(); // coalesced with the first
//! flag.set_and_wait().await.unwrap(); // resolves after a full run
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::Error;
use crate::latch::Latch;

/// Coalesced single-callback scheduler.
///
/// Clones share the same flag. The handle is tied to the thread's compio
/// runtime: the runner is spawned with `compio::runtime::spawn`.
#[derive(Clone)]
pub struct TaskFlag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    callback: Box<dyn Fn() -> LocalBoxFuture<'static, ()>>,
    delay: Option<Duration>,
    state: Mutex<FlagState>,
    /// Set once the runner has exited after `close()`.
    idle: Latch,
}

struct FlagState {
    pending: bool,
    running: bool,
    closed: bool,
    /// `set_and_wait` callers not yet covered by a started run.
    waiting: Vec<oneshot::Sender<()>>,
}

impl TaskFlag {
    /// Create a flag with the callback to run when set.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::build(None, callback)
    }

    /// Create a flag whose runner waits `delay` before each run, absorbing
    /// further `set`s in the meantime.
    pub fn with_delay<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::build(Some(delay), callback)
    }

    fn build<F, Fut>(delay: Option<Duration>, callback: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self {
            inner: Arc::new(FlagInner {
                callback: Box::new(move || callback().boxed_local()),
                delay,
                state: Mutex::new(FlagState {
                    pending: false,
                    running: false,
                    closed: false,
                    waiting: Vec::new(),
                }),
                idle: Latch::new(),
            }),
        }
    }

    /// Mark work as pending; schedule a run if none is in progress.
    ///
    /// Fails with [`Error::Closed`] after [`TaskFlag::close`].
    pub fn set(&self) -> Result<(), Error> {
        let spawn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state.pending = true;
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if spawn {
            self.spawn_runner();
        }
        Ok(())
    }

    /// As [`TaskFlag::set`], resolving after the end of a run that began at
    /// or after this call's set was observed.
    pub async fn set_and_wait(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let spawn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state.pending = true;
            state.waiting.push(tx);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if spawn {
            self.spawn_runner();
        }
        rx.await.map_err(|_| Error::Closed)
    }

    /// Whether a run is currently owed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Close the flag and wait for the runner to go idle.
    ///
    /// Later `set`s fail with [`Error::Closed`]. A run in progress finishes;
    /// a run not yet started (e.g. still in its delay) is skipped, and its
    /// `set_and_wait` callers fail with [`Error::Closed`]. Idempotent.
    pub async fn close(&self) {
        let running = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.running
        };
        if !running {
            self.inner.idle.set();
        }
        self.inner.idle.wait().await;
    }

    fn spawn_runner(&self) {
        let inner = self.inner.clone();
        compio::runtime::spawn(async move {
            loop {
                if let Some(delay) = inner.delay {
                    compio::time::sleep(delay).await;
                }
                let batch = {
                    let mut state = inner.state.lock();
                    if state.closed {
                        state.running = false;
                        // Drop the senders; their set never got a run.
                        let orphaned = std::mem::take(&mut state.waiting);
                        drop(state);
                        drop(orphaned);
                        inner.idle.set();
                        return;
                    }
                    state.pending = false;
                    std::mem::take(&mut state.waiting)
                };

                // A panicking callback is contained: the pending bit still
                // gets re-examined below and the next set still runs.
                let _ = AssertUnwindSafe((inner.callback)()).catch_unwind().await;

                for tx in batch {
                    let _ = tx.send(());
                }

                let closed = {
                    let mut state = inner.state.lock();
                    if state.pending && !state.closed {
                        continue;
                    }
                    state.running = false;
                    state.closed
                };
                if closed {
                    inner.idle.set();
                }
                return;
            }
        })
        .detach();
    }
}
