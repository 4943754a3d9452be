//! Async counting semaphore with strict FIFO waiters
//!
//! Bounds concurrency the usual way — a fixed pool of permits that must be
//! acquired before doing work — with two contracts layered on top:
//!
//! - **Strict FIFO handoff**: a released permit is transferred directly to
//!   the oldest pending waiter before the free count is restored, so a
//!   newly arriving caller can never barge past the queue under steady load.
//! - **Asynchronous close**: [`Semaphore::close`] fails every queued waiter,
//!   refuses new acquires, and resolves once every outstanding permit has
//!   been returned.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_coord::Semaphore;
//! use std::sync::Arc;
//!
//! #[compio::main]
//! async fn main() {
//!     let sem = Arc::new(Semaphore::new(100));
//!
//!     // Spawn many tasks, but only 100 run concurrently
//!     for i in 0..1000 {
//!         let sem = sem.clone();
//!         compio::runtime::spawn(async move {
//!             let _permit = sem.acquire().await.unwrap();
//!             println!("Task {}", i);
//!         })
//!         .detach();
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;
use crate::latch::Latch;
use crate::wait_queue::{WaitState, Waiter, WaiterList};

/// An async semaphore for bounding concurrency.
///
/// # Design
///
/// - **Short critical sections**: the permit count and the waiter queue live
///   under one `parking_lot` mutex held only for memory operations, never
///   across an `.await`.
/// - **FIFO handoff**: release transfers the permit to the queue head when
///   one is pending; the free count is only restored when nobody waits.
/// - **RAII permits**: [`SemaphorePermit`] releases on drop; releasing twice
///   is unrepresentable.
/// - **Cancel-safe waits**: dropping an [`Acquire`] future retires its queued
///   waiter, and a grant that raced the drop is released on the caller's
///   behalf — a waiter cancelled the instant before being granted never
///   leaks the permit.
pub struct Semaphore {
    max_permits: usize,
    state: Mutex<SemState>,
    drained: Latch,
}

struct SemState {
    /// Free permits. Positive only while no waiter is pending: release
    /// grants before it increments, and acquire enqueues only at zero.
    permits: usize,
    closed: bool,
    waiters: WaiterList,
}

impl Semaphore {
    /// Create a new semaphore with the given number of permits.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is 0 (a semaphore must have at least one permit).
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_coord::Semaphore;
    ///
    /// let sem = Semaphore::new(1024);
    /// assert_eq!(sem.available_permits(), 1024);
    /// ```
    #[must_use]
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "Semaphore must have at least one permit");
        Self {
            max_permits: permits,
            state: Mutex::new(SemState {
                permits,
                closed: false,
                waiters: WaiterList::new(),
            }),
            drained: Latch::new(),
        }
    }

    /// Acquire a permit, waiting asynchronously if none are available.
    ///
    /// Resolves to [`Error::Closed`] if the semaphore is closed before or
    /// while waiting. Waiters are granted in strict arrival order.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use compio_coord::Semaphore;
    ///
    /// # async fn example() {
    /// let sem = Semaphore::new(10);
    ///
    /// let permit = sem.acquire().await.unwrap();
    /// // Do work...
    /// drop(permit); // Release permit
    /// # }
    /// ```
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            waiter: None,
        }
    }

    /// Acquire a permit with a deadline.
    ///
    /// Equivalent to racing [`Semaphore::acquire`] against the timer: on
    /// expiry the wait fails with [`Error::TimedOut`], the queued waiter is
    /// retired, and a permit granted in the race window is returned to the
    /// semaphore.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<SemaphorePermit<'_>, Error> {
        match compio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if no permit is available or the semaphore is closed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_coord::Semaphore;
    ///
    /// let sem = Semaphore::new(1);
    ///
    /// let permit1 = sem.try_acquire();
    /// assert!(permit1.is_some());
    ///
    /// let permit2 = sem.try_acquire();
    /// assert!(permit2.is_none()); // No permits left
    /// ```
    #[must_use]
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut state = self.state.lock();
        if state.closed || state.permits == 0 {
            return None;
        }
        state.permits -= 1;
        Some(SemaphorePermit { semaphore: self })
    }

    /// Close the semaphore and wait for it to drain.
    ///
    /// Every queued waiter fails with [`Error::Closed`] and subsequent
    /// acquires are refused. Outstanding permits stay valid; the returned
    /// future resolves once all of them have been released. Idempotent: a
    /// second call waits on (or immediately observes) the same drain.
    pub async fn close(&self) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            if state.closed {
                (Vec::new(), false)
            } else {
                state.closed = true;
                let woken = state.waiters.close_all();
                (woken, state.permits == self.max_permits)
            }
        };
        if drained {
            self.drained.set();
        }
        for waiter in woken {
            waiter.wake();
        }
        self.drained.wait().await;
    }

    /// Whether [`Semaphore::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get the number of available permits.
    ///
    /// Useful for monitoring and debugging; the value may change immediately
    /// after reading.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_coord::Semaphore;
    ///
    /// let sem = Semaphore::new(100);
    /// assert_eq!(sem.available_permits(), 100);
    ///
    /// let _permit = sem.try_acquire().unwrap();
    /// assert_eq!(sem.available_permits(), 99);
    /// ```
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Get the maximum number of permits (configured limit).
    #[must_use]
    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Get the number of permits currently in use (max - available).
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_coord::Semaphore;
    ///
    /// let sem = Semaphore::new(100);
    /// let _permit = sem.try_acquire().unwrap();
    /// assert_eq!(sem.in_use(), 1);
    /// ```
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.max_permits - self.available_permits()
    }

    /// Get the number of tasks currently queued for a permit.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.pending_count()
    }

    /// Return one permit (called by `SemaphorePermit::drop` and by wait
    /// futures that observed a grant they can no longer deliver).
    fn release_raw(&self) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            match state.waiters.grant_next() {
                // Transfer directly; the free count is untouched so the
                // permit cannot be stolen by a barging try_acquire.
                Some(waiter) => (Some(waiter), false),
                None => {
                    state.permits += 1;
                    debug_assert!(state.permits <= self.max_permits);
                    (None, state.closed && state.permits == self.max_permits)
                }
            }
        };
        if drained {
            self.drained.set();
        }
        // Wake outside the critical section: the resumed task may call right
        // back into the semaphore on this thread.
        if let Some(waiter) = woken {
            waiter.wake();
        }
    }
}

/// RAII guard that releases a semaphore permit on drop.
///
/// Returned by [`Semaphore::acquire`], [`Semaphore::acquire_timeout`] and
/// [`Semaphore::try_acquire`]. Dropping it hands the permit to the oldest
/// queued waiter, or restores the free count when nobody waits.
///
/// # Example
///
/// ```rust,no_run
/// use compio_coord::Semaphore;
///
/// # async fn example() {
/// let sem = Semaphore::new(10);
///
/// {
///     let _permit = sem.acquire().await.unwrap();
///     // Permit is held here
/// } // Permit released automatically when scope ends
///
/// assert_eq!(sem.available_permits(), 10);
/// # }
/// ```
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release_raw();
    }
}

/// Future returned by [`Semaphore::acquire`].
///
/// Fast path: takes a free permit under the state lock. Slow path: enqueues
/// a waiter record and suspends until a release grants it, the semaphore
/// closes, or this future is dropped.
pub struct Acquire<'a> {
    semaphore: &'a Semaphore,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> Future for Acquire<'a> {
    type Output = Result<SemaphorePermit<'a>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = &this.waiter {
                return match waiter.poll_wait(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(WaitState::Granted) => {
                        this.waiter = None;
                        Poll::Ready(Ok(SemaphorePermit {
                            semaphore: this.semaphore,
                        }))
                    }
                    Poll::Ready(WaitState::Closed) => {
                        this.waiter = None;
                        Poll::Ready(Err(Error::Closed))
                    }
                    Poll::Ready(_) => {
                        this.waiter = None;
                        Poll::Ready(Err(Error::Cancelled))
                    }
                };
            }

            let waiter = {
                let mut state = this.semaphore.state.lock();
                if state.closed {
                    return Poll::Ready(Err(Error::Closed));
                }
                if state.permits > 0 {
                    state.permits -= 1;
                    return Poll::Ready(Ok(SemaphorePermit {
                        semaphore: this.semaphore,
                    }));
                }
                let waiter = Waiter::new();
                state.waiters.push(waiter.clone());
                waiter
            };
            this.waiter = Some(waiter);
            // Loop to register the waker; a release may already have granted
            // the waiter between the push above and this poll.
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.try_complete(WaitState::Cancelled) {
                self.semaphore.state.lock().waiters.prune();
            } else if waiter.wait_terminal() == WaitState::Granted {
                // The grant raced this drop; hand the permit back.
                self.semaphore.release_raw();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_new() {
        let sem = Semaphore::new(100);
        assert_eq!(sem.available_permits(), 100);
        assert_eq!(sem.max_permits(), 100);
        assert_eq!(sem.in_use(), 0);
        assert_eq!(sem.waiting_count(), 0);
    }

    #[test]
    fn test_semaphore_try_acquire() {
        let sem = Semaphore::new(2);

        let permit1 = sem.try_acquire();
        assert!(permit1.is_some());
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.in_use(), 1);

        let permit2 = sem.try_acquire();
        assert!(permit2.is_some());
        assert_eq!(sem.available_permits(), 0);

        let permit3 = sem.try_acquire();
        assert!(permit3.is_none());

        drop(permit1);
        assert_eq!(sem.available_permits(), 1);

        let permit4 = sem.try_acquire();
        assert!(permit4.is_some());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_semaphore_permit_drop() {
        let sem = Semaphore::new(1);

        {
            let _permit = sem.try_acquire().unwrap();
            assert_eq!(sem.available_permits(), 0);
        } // Permit dropped here

        assert_eq!(sem.available_permits(), 1);
    }

    #[compio::test]
    async fn test_semaphore_acquire_basic() {
        let sem = Semaphore::new(2);

        let permit1 = sem.acquire().await.unwrap();
        assert_eq!(sem.available_permits(), 1);

        let permit2 = sem.acquire().await.unwrap();
        assert_eq!(sem.available_permits(), 0);

        drop(permit1);
        assert_eq!(sem.available_permits(), 1);

        drop(permit2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    #[should_panic(expected = "Semaphore must have at least one permit")]
    fn test_semaphore_zero_permits_panics() {
        let _sem = Semaphore::new(0);
    }
}
