//! One-way set-once latch for monotonic completion conditions
//!
//! Close protocols only ever move forward: a semaphore that has drained stays
//! drained, a cancelled token stays cancelled. The latch is the minimal
//! primitive for waiting on such a condition: `set()` once, any number of
//! `wait()`s before or after.
//!
//! The check-under-lock discipline prevents the lost-wakeup TOCTOU: a waiter
//! re-checks the flag while holding the waker list lock, and the setter flips
//! the flag before draining the list, so no waker can be registered after a
//! set without observing it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;

pub(crate) struct Latch {
    set: AtomicBool,
    waiters: Mutex<Vec<std::task::Waker>>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Set the latch and wake everyone waiting on it. Idempotent.
    pub(crate) fn set(&self) {
        if self.set.swap(true, Ordering::AcqRel) {
            return;
        }
        let woken = std::mem::take(&mut *self.waiters.lock());
        for waker in woken {
            waker.wake();
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self) -> LatchWait<'_> {
        LatchWait { latch: self }
    }
}

pub(crate) struct LatchWait<'a> {
    latch: &'a Latch,
}

impl Future for LatchWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.latch.is_set() {
            return Poll::Ready(());
        }
        let mut waiters = self.latch.waiters.lock();
        // Re-check while holding the list lock; a set that landed between the
        // fast check and the lock acquisition already drained the list.
        if self.latch.is_set() {
            return Poll::Ready(());
        }
        waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let latch = Latch::new();
        assert!(!latch.is_set());
    }

    #[test]
    fn set_is_idempotent() {
        let latch = Latch::new();
        latch.set();
        latch.set();
        assert!(latch.is_set());
    }

    #[compio::test]
    async fn wait_after_set_completes_immediately() {
        let latch = Latch::new();
        latch.set();
        latch.wait().await;
    }

    #[compio::test]
    async fn wait_resumes_on_set() {
        let latch = std::sync::Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            compio::runtime::spawn(async move {
                latch.wait().await;
            })
        };
        compio::time::sleep(std::time::Duration::from_millis(10)).await;
        latch.set();
        compio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("waiter should resume after set")
            .expect("waiter task should succeed");
    }
}
