//! Cooperative cancellation handle
//!
//! A [`CancellationToken`] is the caller-supplied abort signal accepted by
//! the waiting operations in this crate: cancellation is requested with
//! [`cancel`](CancellationToken::cancel), observed synchronously with
//! [`is_cancelled`](CancellationToken::is_cancelled), and observed
//! asynchronously with [`cancelled`](CancellationToken::cancelled) — the
//! future form of an "on cancel" registration hook.
//!
//! Waits compose with a token through
//! [`run_until_cancelled`](CancellationToken::run_until_cancelled): the inner
//! future is dropped when the token fires, and every wait future in this
//! crate treats being dropped as cancellation (the waiter record is retired
//! and an already-transferred grant is returned), so nothing leaks.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_coord::{CancellationToken, Error, Semaphore};
//!
//! # async fn example(sem: &Semaphore) -> Result<(), Error> {
//! let token = CancellationToken::new();
//! let permit = token.run_until_cancelled(sem.acquire()).await??;
//! // ... work while holding the permit ...
//! drop(permit);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::{select, Either};
use futures::pin_mut;

use crate::error::Error;
use crate::latch::Latch;

/// Clone-able cancellation handle. All clones observe the same state;
/// cancellation is monotonic (`false → true`, once).
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Latch>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Latch::new()),
        }
    }

    /// Request cancellation. Idempotent; wakes every `cancelled()` waiter.
    pub fn cancel(&self) {
        self.inner.set();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_set()
    }

    /// Resolves once the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        self.inner.wait().await;
    }

    /// Drive `future` to completion unless the token fires first.
    ///
    /// An already-cancelled token fails with [`Error::Cancelled`] without
    /// polling `future` at all, so no primitive state is touched. If the
    /// token fires mid-wait, `future` is dropped — which for this crate's
    /// wait futures retires the queued waiter and returns any grant that
    /// raced the cancellation.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cancelled = self.inner.wait();
        pin_mut!(future);
        match select(future, cancelled).await {
            Either::Left((output, _)) => Ok(output),
            Either::Right(((), _)) => Err(Error::Cancelled),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
