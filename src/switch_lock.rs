//! Two-color readers lock ("left" / "right")
//!
//! Any number of holders of the same side run concurrently; the two sides
//! are mutually exclusive. When the last holder of the active side releases,
//! the entire opposite queue is granted in FIFO order and the side flips.
//!
//! Two admission policies:
//!
//! - **Fair** (default): a new acquirer of the active side defers to pending
//!   opposite-side waiters, so neither side can be starved.
//! - **Unfair**: a new acquirer of the active side is admitted regardless of
//!   opposite waiters. Higher throughput, opt-in starvation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;
use crate::latch::Latch;
use crate::wait_queue::{WaitState, Waiter, WaiterList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A lock with two mutually exclusive sides and shared access within a side.
///
/// # Example
///
/// ```rust,no_run
/// use compio_coord::SwitchLock;
///
/// # async fn example() {
/// let lock = SwitchLock::new();
///
/// let a = lock.lock_left().await.unwrap();
/// let b = lock.lock_left().await.unwrap(); // same side, no wait
/// assert!(lock.is_left());
/// drop(a);
/// drop(b);
///
/// let c = lock.lock_right().await.unwrap();
/// assert!(lock.is_right());
/// drop(c);
/// # }
/// ```
pub struct SwitchLock {
    unfair: bool,
    state: Mutex<SwitchState>,
    drained: Latch,
}

struct SwitchState {
    /// Active side; `None` means idle. `Some` implies `active > 0`.
    side: Option<Side>,
    active: usize,
    closed: bool,
    left: WaiterList,
    right: WaiterList,
}

impl SwitchState {
    fn list_mut(&mut self, side: Side) -> &mut WaiterList {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

impl SwitchLock {
    /// Create a switch lock with fair admission.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Create a switch lock with unfair admission: acquirers of the active
    /// side bypass opposite-side waiters.
    #[must_use]
    pub fn new_unfair() -> Self {
        Self::with_fairness(true)
    }

    fn with_fairness(unfair: bool) -> Self {
        Self {
            unfair,
            state: Mutex::new(SwitchState {
                side: None,
                active: 0,
                closed: false,
                left: WaiterList::new(),
                right: WaiterList::new(),
            }),
            drained: Latch::new(),
        }
    }

    /// Acquire the left side, waiting while the right side is active (or,
    /// in fair mode, while right waiters are pending).
    pub fn lock_left(&self) -> LockSide<'_> {
        LockSide {
            lock: self,
            side: Side::Left,
            waiter: None,
        }
    }

    /// Acquire the right side. Symmetric to [`SwitchLock::lock_left`].
    pub fn lock_right(&self) -> LockSide<'_> {
        LockSide {
            lock: self,
            side: Side::Right,
            waiter: None,
        }
    }

    /// [`SwitchLock::lock_left`] with a deadline; [`Error::TimedOut`] on
    /// expiry.
    pub async fn lock_left_timeout(&self, timeout: Duration) -> Result<SwitchGuard<'_>, Error> {
        match compio::time::timeout(timeout, self.lock_left()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// [`SwitchLock::lock_right`] with a deadline; [`Error::TimedOut`] on
    /// expiry.
    pub async fn lock_right_timeout(&self, timeout: Duration) -> Result<SwitchGuard<'_>, Error> {
        match compio::time::timeout(timeout, self.lock_right()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    #[must_use]
    pub fn is_left(&self) -> bool {
        self.state.lock().side == Some(Side::Left)
    }

    #[must_use]
    pub fn is_right(&self) -> bool {
        self.state.lock().side == Some(Side::Right)
    }

    /// Number of tasks queued for the left side.
    #[must_use]
    pub fn waiting_left(&self) -> usize {
        self.state.lock().left.pending_count()
    }

    /// Number of tasks queued for the right side.
    #[must_use]
    pub fn waiting_right(&self) -> usize {
        self.state.lock().right.pending_count()
    }

    #[must_use]
    pub fn is_unfair(&self) -> bool {
        self.unfair
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the lock and wait for both sides to drain.
    ///
    /// Pending waiters of both sides fail with [`Error::Closed`]; outstanding
    /// holders release normally. Resolves when neither side is active.
    /// Idempotent.
    pub async fn close(&self) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            if state.closed {
                (Vec::new(), false)
            } else {
                state.closed = true;
                let mut woken = state.left.close_all();
                woken.extend(state.right.close_all());
                (woken, state.active == 0)
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

    fn release(&self, side: Side) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            state.active -= 1;
            if state.active > 0 {
                (Vec::new(), false)
            } else {
                // Last holder out: flip to the opposite side if it has
                // waiters; re-admit same-side waiters if every opposite
                // waiter cancelled while we were active; otherwise go idle.
                let granted = state.list_mut(side.other()).grant_all();
                if !granted.is_empty() {
                    state.side = Some(side.other());
                    state.active = granted.len();
                    (granted, false)
                } else {
                    let granted = state.list_mut(side).grant_all();
                    if !granted.is_empty() {
                        state.side = Some(side);
                        state.active = granted.len();
                        (granted, false)
                    } else {
                        state.side = None;
                        (Vec::new(), state.closed)
                    }
                }
            }
        };
        if drained {
            self.drained.set();
        }
        // Wakes only schedule the resumed tasks; nothing runs inline, which
        // keeps long alternation chains off this call stack.
        for waiter in woken {
            waiter.wake();
        }
    }

    /// After a queued waiter on `side` cancels: if it was the last pending
    /// opposite-side waiter, admit the active side's queue (fair-mode
    /// arrivals that were deferring to it).
    fn cancel_cleanup(&self, side: Side) {
        let woken = {
            let mut state = self.state.lock();
            state.list_mut(side).prune();
            let mut granted = Vec::new();
            let side_now = state.side;
            if let Some(current) = side_now {
                if current != side && state.active > 0 && !state.list_mut(side).has_pending() {
                    granted = state.list_mut(current).grant_all();
                    state.active += granted.len();
                }
            }
            granted
        };
        for waiter in woken {
            waiter.wake();
        }
    }
}

impl Default for SwitchLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one side of a [`SwitchLock`].
pub struct SwitchGuard<'a> {
    lock: &'a SwitchLock,
    side: Side,
}

impl SwitchGuard<'_> {
    /// Whether this guard holds the left side.
    #[must_use]
    pub fn is_left(&self) -> bool {
        self.side == Side::Left
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.side);
    }
}

/// Future returned by [`SwitchLock::lock_left`] / [`SwitchLock::lock_right`].
pub struct LockSide<'a> {
    lock: &'a SwitchLock,
    side: Side,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> Future for LockSide<'a> {
    type Output = Result<SwitchGuard<'a>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = &this.waiter {
                return match waiter.poll_wait(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(WaitState::Granted) => {
                        this.waiter = None;
                        Poll::Ready(Ok(SwitchGuard {
                            lock: this.lock,
                            side: this.side,
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
                let mut state = this.lock.state.lock();
                if state.closed {
                    return Poll::Ready(Err(Error::Closed));
                }
                let side_now = state.side;
                let admit = match side_now {
                    None => true,
                    Some(current) if current == this.side => {
                        this.lock.unfair || !state.list_mut(this.side.other()).has_pending()
                    }
                    _ => false,
                };
                if admit {
                    state.side = Some(this.side);
                    state.active += 1;
                    return Poll::Ready(Ok(SwitchGuard {
                        lock: this.lock,
                        side: this.side,
                    }));
                }
                let waiter = Waiter::new();
                state.list_mut(this.side).push(waiter.clone());
                waiter
            };
            this.waiter = Some(waiter);
        }
    }
}

impl Drop for LockSide<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.try_complete(WaitState::Cancelled) {
                self.lock.cancel_cleanup(self.side);
            } else if waiter.wait_terminal() == WaitState::Granted {
                self.lock.release(self.side);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn test_same_side_is_shared() {
        let lock = SwitchLock::new();
        let a = lock.lock_left().await.unwrap();
        let b = lock.lock_left().await.unwrap();
        assert!(lock.is_left());
        assert!(!lock.is_right());
        assert!(a.is_left());
        drop(a);
        assert!(lock.is_left());
        drop(b);
        assert!(!lock.is_left());
        assert!(!lock.is_right());
    }

    #[compio::test]
    async fn test_idle_lock_admits_either_side() {
        let lock = SwitchLock::new();
        {
            let _left = lock.lock_left().await.unwrap();
            assert!(lock.is_left());
        }
        {
            let _right = lock.lock_right().await.unwrap();
            assert!(lock.is_right());
        }
    }

    #[test]
    fn test_fairness_flag() {
        assert!(!SwitchLock::new().is_unfair());
        assert!(SwitchLock::new_unfair().is_unfair());
    }
}
