//! Waiter records and FIFO grant lists shared by every primitive
//!
//! Each suspended caller is represented by a [`Waiter`]: an atomic state
//! machine plus a waker slot. Waiters live in a [`WaiterList`] owned by the
//! primitive that enqueued them, always behind that primitive's mutex.
//!
//! Capacity is transferred by *granting*: a releaser marks the oldest pending
//! waiter `Granted` instead of restoring the free count, so a newly arriving
//! caller can never barge past the queue. The `Pending → Completing` CAS is
//! the single arbitration point between grant, cancellation, and close; only
//! the first transition wins and the losers observe a terminal state.
//!
//! # Why a mutex-owned VecDeque?
//!
//! Same trade-off as the multi-waiter path of the waiter queue this module
//! grew out of: the list is only touched for a few memory operations under a
//! `parking_lot` lock that is never held across an `.await`, and the `Arc`
//! nodes make lazy unlinking trivial. Cancelled waiters stay in the deque
//! until a grant or a prune walks past them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use atomic_waker::AtomicWaker;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Lifecycle of a single queued wait.
///
/// Transitions are one-way: `Pending → Completing → {Granted, Cancelled,
/// Closed}`. `Completing` is a short-lived claim window; whoever wins the
/// `Pending → Completing` CAS stores the terminal state immediately after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum WaitState {
    /// Queued, still eligible for a grant
    Pending = 0,
    /// A completer won the CAS and is about to store the terminal state
    Completing = 1,
    /// Capacity was transferred to this waiter
    Granted = 2,
    /// The wait was abandoned (future dropped, deadline, sibling won)
    Cancelled = 3,
    /// The owning primitive was closed while the waiter was queued
    Closed = 4,
}

/// One suspended caller.
///
/// Shared between the wait future (which polls it) and the owning
/// [`WaiterList`] (which grants or closes it). The optional `claim` links
/// sibling waiters of a wait-any group: a grant must also win the claim, and
/// a grant that loses it converts the waiter to `Cancelled` so the granting
/// queue passes its unit to the next pending waiter instead.
pub(crate) struct Waiter {
    state: AtomicU8,
    waker: AtomicWaker,
    claim: Option<Arc<AtomicBool>>,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WaitState::Pending.into()),
            waker: AtomicWaker::new(),
            claim: None,
        })
    }

    pub(crate) fn with_claim(claim: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WaitState::Pending.into()),
            waker: AtomicWaker::new(),
            claim: Some(claim),
        })
    }

    pub(crate) fn state(&self) -> WaitState {
        WaitState::try_from(self.state.load(Ordering::Acquire)).expect("invalid waiter state")
    }

    /// Spin past a `Completing` window and return the terminal state.
    ///
    /// The window is a handful of instructions on the completer's side (CAS
    /// then store, no suspension possible in between), so spinning is bounded.
    pub(crate) fn wait_terminal(&self) -> WaitState {
        loop {
            match self.state() {
                WaitState::Completing => std::hint::spin_loop(),
                state => return state,
            }
        }
    }

    fn begin_complete(&self) -> bool {
        self.state
            .compare_exchange(
                WaitState::Pending.into(),
                WaitState::Completing.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn commit(&self, terminal: WaitState) {
        debug_assert!(!matches!(terminal, WaitState::Pending | WaitState::Completing));
        self.state.store(terminal.into(), Ordering::Release);
    }

    /// Attempt the `Pending → terminal` transition and wake the waiter.
    ///
    /// Returns `false` if another completer already won; the caller can then
    /// read [`Waiter::wait_terminal`] to learn what happened instead.
    pub(crate) fn try_complete(&self, terminal: WaitState) -> bool {
        if self.begin_complete() {
            self.commit(terminal);
            self.waker.wake();
            true
        } else {
            false
        }
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    /// Register the current task and report the wait's progress.
    ///
    /// Registration happens before the state read, so a completion that lands
    /// in between still finds the waker and re-polls us.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<WaitState> {
        self.waker.register(cx.waker());
        match self.state() {
            WaitState::Pending | WaitState::Completing => Poll::Pending,
            terminal => Poll::Ready(terminal),
        }
    }
}

/// FIFO list of waiters, owned by a primitive and protected by its mutex.
///
/// Waking is deliberately left to the caller: grant methods commit the state
/// transition and hand back the affected waiters so the wakes can run after
/// the primitive's lock is dropped.
pub(crate) struct WaiterList {
    queue: VecDeque<Arc<Waiter>>,
}

impl WaiterList {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, waiter: Arc<Waiter>) {
        self.queue.push_back(waiter);
    }

    /// Grant one unit of capacity to the oldest pending waiter.
    ///
    /// Waiters that were cancelled while queued are skipped and dropped. A
    /// waiter that wins the state CAS but loses its group claim is converted
    /// to `Cancelled` and the unit moves on to the next candidate. Returns
    /// the granted waiter; the caller must wake it after releasing the lock.
    pub(crate) fn grant_next(&mut self) -> Option<Arc<Waiter>> {
        while let Some(waiter) = self.queue.pop_front() {
            if !waiter.begin_complete() {
                continue;
            }
            if let Some(claim) = &waiter.claim {
                if claim.swap(true, Ordering::AcqRel) {
                    waiter.commit(WaitState::Cancelled);
                    waiter.wake();
                    continue;
                }
            }
            waiter.commit(WaitState::Granted);
            return Some(waiter);
        }
        None
    }

    /// Grant every pending waiter, preserving queue order.
    pub(crate) fn grant_all(&mut self) -> Vec<Arc<Waiter>> {
        let mut granted = Vec::new();
        while let Some(waiter) = self.grant_next() {
            granted.push(waiter);
        }
        granted
    }

    /// Fail every pending waiter with `Closed`.
    pub(crate) fn close_all(&mut self) -> Vec<Arc<Waiter>> {
        let mut closed = Vec::new();
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.begin_complete() {
                waiter.commit(WaitState::Closed);
                closed.push(waiter);
            }
        }
        closed
    }

    /// Drop completed waiters from the head of the queue.
    pub(crate) fn prune(&mut self) {
        while let Some(waiter) = self.queue.front() {
            if waiter.state() == WaitState::Pending {
                break;
            }
            self.queue.pop_front();
        }
    }

    /// Whether any waiter is still eligible for a grant.
    ///
    /// Prunes first so the answer reduces to a head check: a non-empty queue
    /// whose head is completed would keep pruning until a pending waiter (or
    /// nothing) remains.
    pub(crate) fn has_pending(&mut self) -> bool {
        self.prune();
        !self.queue.is_empty()
    }

    /// Best-effort count of pending waiters, for observability.
    pub(crate) fn pending_count(&self) -> usize {
        self.queue
            .iter()
            .filter(|waiter| waiter.state() == WaitState::Pending)
            .count()
    }
}

impl Default for WaiterList {
    fn default() -> Self {
        Self::new()
    }
}
