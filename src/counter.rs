//! Unbounded async counter with consuming and observing waiters
//!
//! A [`Counter`] is the producer/consumer half-primitive: `increment` adds a
//! unit, `decrement` consumes one (waiting while the value is zero), and
//! `peek` waits for the value to become positive without consuming it.
//! Units are handed to the oldest pending decrement waiter directly, so the
//! value never turns positive while a consumer is queued.
//!
//! [`Counter::decrement_any`] waits on several counters at once and consumes
//! from whichever can supply a unit first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;
use crate::wait_queue::{WaitState, Waiter, WaiterList};

/// An async counting primitive without an upper bound.
///
/// Like a semaphore with no ceiling and no permit object: a unit consumed by
/// [`Counter::decrement`] is simply gone until somebody calls
/// [`Counter::increment`] again.
pub struct Counter {
    state: Mutex<CounterState>,
}

struct CounterState {
    /// Positive only while no decrement waiter is pending: increments hand
    /// the unit to the queue head first.
    value: usize,
    closed: bool,
    decrements: WaiterList,
    peeks: WaiterList,
}

impl Counter {
    /// Create a counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_count(0)
    }

    /// Create a counter with an initial value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_coord::Counter;
    ///
    /// let counter = Counter::with_count(3);
    /// assert_eq!(counter.value(), 3);
    /// assert!(counter.try_decrement());
    /// ```
    #[must_use]
    pub fn with_count(value: usize) -> Self {
        Self {
            state: Mutex::new(CounterState {
                value,
                closed: false,
                decrements: WaiterList::new(),
                peeks: WaiterList::new(),
            }),
        }
    }

    /// Add one unit.
    ///
    /// If a decrement waiter is queued the unit is transferred to it and the
    /// value stays zero. Every pending [`Counter::peek`] resolves. Fails with
    /// [`Error::Closed`] once the counter is closed.
    pub fn increment(&self) -> Result<(), Error> {
        let (granted, peeked) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            let granted = state.decrements.grant_next();
            if granted.is_none() {
                state.value += 1;
            }
            (granted, state.peeks.grant_all())
        };
        if let Some(waiter) = granted {
            waiter.wake();
        }
        for waiter in peeked {
            waiter.wake();
        }
        Ok(())
    }

    /// Consume one unit, waiting while the value is zero.
    ///
    /// Waiters are served FIFO. Fails with [`Error::Closed`] if the counter
    /// is closed before or while waiting — a closed counter's remaining value
    /// is abandoned, not drained.
    pub fn decrement(&self) -> Decrement<'_> {
        Decrement {
            counter: self,
            waiter: None,
        }
    }

    /// [`Counter::decrement`] with a deadline; [`Error::TimedOut`] on expiry.
    pub async fn decrement_timeout(&self, timeout: Duration) -> Result<(), Error> {
        match compio::time::timeout(timeout, self.decrement()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Consume one unit if the value is positive. Never waits.
    #[must_use]
    pub fn try_decrement(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.value == 0 {
            return false;
        }
        state.value -= 1;
        true
    }

    /// Wait until the value is positive without consuming anything.
    ///
    /// Every pending peek resolves on the next increment, even when the unit
    /// itself is transferred to a decrement waiter.
    pub fn peek(&self) -> Peek<'_> {
        Peek {
            counter: self,
            waiter: None,
        }
    }

    /// Whether the value is currently positive. Never waits.
    #[must_use]
    pub fn try_peek(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.value > 0
    }

    /// Consume one unit from whichever counter can supply one first.
    ///
    /// Counters are first scanned in slice order with
    /// [`Counter::try_decrement`]; ties go to the lowest index. If none has a
    /// unit, one waiter is queued per counter and the first grant wins — the
    /// siblings are cancelled and leave no residue. Resolves to the winning
    /// index, or [`Error::Closed`] once every counter in the set is closed.
    ///
    /// # Panics
    ///
    /// Panics if `counters` is empty.
    pub fn decrement_any<'a>(counters: &'a [&'a Counter]) -> DecrementAny<'a> {
        assert!(
            !counters.is_empty(),
            "decrement_any requires at least one counter"
        );
        DecrementAny {
            counters,
            entries: Vec::new(),
            started: false,
            finished: false,
        }
    }

    /// Current value. Best-effort snapshot.
    #[must_use]
    pub fn value(&self) -> usize {
        self.state.lock().value
    }

    /// Number of queued decrement waiters.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.state.lock().decrements.pending_count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the counter: pending decrements and peeks fail with
    /// [`Error::Closed`], later increments and decrements are refused, and
    /// the remaining value is abandoned. Idempotent.
    pub async fn close(&self) {
        let woken = {
            let mut state = self.state.lock();
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                let mut woken = state.decrements.close_all();
                woken.extend(state.peeks.close_all());
                woken
            }
        };
        for waiter in woken {
            waiter.wake();
        }
    }

    /// Put a unit back after a wait future observed a grant it can no longer
    /// deliver. Mirrors `increment`, but ignores the closed flag: the unit
    /// belonged to the caller and is abandoned with the rest of the value.
    fn return_unit(&self) {
        let granted = {
            let mut state = self.state.lock();
            match state.decrements.grant_next() {
                Some(waiter) => Some(waiter),
                None => {
                    state.value += 1;
                    None
                }
            }
        };
        if let Some(waiter) = granted {
            waiter.wake();
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Counter::decrement`].
pub struct Decrement<'a> {
    counter: &'a Counter,
    waiter: Option<Arc<Waiter>>,
}

impl Future for Decrement<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = &this.waiter {
                return match waiter.poll_wait(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(WaitState::Granted) => {
                        this.waiter = None;
                        Poll::Ready(Ok(()))
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
                let mut state = this.counter.state.lock();
                if state.closed {
                    return Poll::Ready(Err(Error::Closed));
                }
                if state.value > 0 {
                    state.value -= 1;
                    return Poll::Ready(Ok(()));
                }
                let waiter = Waiter::new();
                state.decrements.push(waiter.clone());
                waiter
            };
            this.waiter = Some(waiter);
        }
    }
}

impl Drop for Decrement<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.try_complete(WaitState::Cancelled) {
                self.counter.state.lock().decrements.prune();
            } else if waiter.wait_terminal() == WaitState::Granted {
                self.counter.return_unit();
            }
        }
    }
}

/// Future returned by [`Counter::peek`].
pub struct Peek<'a> {
    counter: &'a Counter,
    waiter: Option<Arc<Waiter>>,
}

impl Future for Peek<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = &this.waiter {
                return match waiter.poll_wait(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(WaitState::Granted) => {
                        this.waiter = None;
                        Poll::Ready(Ok(()))
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
                let mut state = this.counter.state.lock();
                if state.closed {
                    return Poll::Ready(Err(Error::Closed));
                }
                if state.value > 0 {
                    return Poll::Ready(Ok(()));
                }
                let waiter = Waiter::new();
                state.peeks.push(waiter.clone());
                waiter
            };
            this.waiter = Some(waiter);
        }
    }
}

impl Drop for Peek<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            // A peek consumes nothing, so a raced grant needs no give-back.
            if waiter.try_complete(WaitState::Cancelled) {
                self.counter.state.lock().peeks.prune();
            }
        }
    }
}

/// Future returned by [`Counter::decrement_any`].
///
/// Holds one group-claimed waiter per still-open counter; the claim
/// guarantees at most one of them is ever granted.
pub struct DecrementAny<'a> {
    counters: &'a [&'a Counter],
    entries: Vec<(usize, Arc<Waiter>)>,
    started: bool,
    finished: bool,
}

impl DecrementAny<'_> {
    /// Retire every entry except `winner`. Entries granted despite the claim
    /// (possible only on the drop path, after a winner was already consumed)
    /// put their unit back.
    fn settle(&mut self, winner: Option<usize>) {
        for (index, waiter) in self.entries.drain(..) {
            if Some(index) == winner {
                continue;
            }
            if !waiter.try_complete(WaitState::Cancelled)
                && waiter.wait_terminal() == WaitState::Granted
            {
                self.counters[index].return_unit();
            }
        }
    }
}

impl Future for DecrementAny<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let counters = this.counters;

        if !this.started {
            this.started = true;

            // Scan order breaks ties among counters that already have units.
            for (index, counter) in counters.iter().enumerate() {
                if counter.try_decrement() {
                    this.finished = true;
                    return Poll::Ready(Ok(index));
                }
            }

            let claim = Arc::new(AtomicBool::new(false));
            for (index, counter) in counters.iter().enumerate() {
                let mut state = counter.state.lock();
                if state.closed {
                    continue;
                }
                if state.value > 0 {
                    // A unit arrived after the scan above. Take it unless a
                    // waiter we already queued has been granted meanwhile.
                    if claim
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        state.value -= 1;
                        drop(state);
                        this.settle(None);
                        this.finished = true;
                        return Poll::Ready(Ok(index));
                    }
                    break;
                }
                let waiter = Waiter::with_claim(claim.clone());
                state.decrements.push(waiter.clone());
                this.entries.push((index, waiter));
            }

            if this.entries.is_empty() {
                this.finished = true;
                return Poll::Ready(Err(Error::Closed));
            }
        }

        let mut terminal = 0;
        let mut winner = None;
        for (index, waiter) in &this.entries {
            match waiter.poll_wait(cx) {
                Poll::Ready(WaitState::Granted) => {
                    winner = Some(*index);
                    break;
                }
                Poll::Ready(_) => terminal += 1,
                Poll::Pending => {}
            }
        }

        if let Some(index) = winner {
            this.settle(Some(index));
            this.finished = true;
            return Poll::Ready(Ok(index));
        }
        if terminal == this.entries.len() {
            this.finished = true;
            return Poll::Ready(Err(Error::Closed));
        }
        Poll::Pending
    }
}

impl Drop for DecrementAny<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.settle(None);
        }
    }
}
