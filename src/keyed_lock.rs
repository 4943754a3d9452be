//! Per-key mutual exclusion registry
//!
//! A [`KeyedLock`] hands out exclusive guards per key: two holders of
//! different keys run concurrently, two callers of the same key queue FIFO.
//! Entries are created lazily on first contact with a key and removed as
//! soon as the last holder or waiter lets go, so the table only ever
//! contains keys somebody currently cares about.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;
use crate::latch::Latch;
use crate::wait_queue::{WaitState, Waiter, WaiterList};

/// Per-key async mutex registry.
///
/// The whole table lives under one mutex; per-key independence is semantic,
/// not structural — the critical sections are a few map operations long, so
/// distinct keys never *wait* on one another.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    state: Mutex<TableState<K>>,
    drained: Latch,
}

struct TableState<K> {
    table: HashMap<K, KeyEntry>,
    closed: bool,
}

/// One key's lock state: the held flag plus everyone interested in the key.
/// `refs` counts the holder and all waiters; at zero the entry is removed.
struct KeyEntry {
    held: bool,
    refs: usize,
    queue: WaiterList,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            held: false,
            refs: 0,
            queue: WaiterList::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                table: HashMap::new(),
                closed: false,
            }),
            drained: Latch::new(),
        }
    }

    /// Take the exclusive lock for `key`.
    ///
    /// Completes immediately when nobody holds the key; otherwise queues
    /// behind the current holder in FIFO order. Distinct keys never block
    /// each other.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use compio_coord::KeyedLock;
    ///
    /// # async fn example() {
    /// let locks = KeyedLock::new();
    ///
    /// let a = locks.lock(1).await.unwrap();
    /// let b = locks.lock(2).await.unwrap(); // different key, no wait
    /// drop(a);
    /// drop(b);
    /// # }
    /// ```
    pub fn lock(&self, key: K) -> LockKey<'_, K> {
        LockKey {
            lock: self,
            key: Some(key),
            waiter: None,
        }
    }

    /// [`KeyedLock::lock`] with a deadline; [`Error::TimedOut`] on expiry.
    pub async fn lock_timeout(&self, key: K, timeout: Duration) -> Result<KeyedGuard<'_, K>, Error> {
        match compio::time::timeout(timeout, self.lock(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Snapshot of the keys currently held.
    #[must_use]
    pub fn keys_held(&self) -> Vec<K> {
        let state = self.state.lock();
        state
            .table
            .iter()
            .filter(|(_, entry)| entry.held)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        let state = self.state.lock();
        state.table.values().filter(|entry| entry.held).count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the registry and wait for it to empty.
    ///
    /// Queued waiters on every key fail with [`Error::Closed`]; outstanding
    /// guards drain normally. Resolves once the table is empty. Idempotent.
    pub async fn close(&self) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            if state.closed {
                (Vec::new(), false)
            } else {
                state.closed = true;
                let mut woken = Vec::new();
                for entry in state.table.values_mut() {
                    woken.extend(entry.queue.close_all());
                }
                (woken, state.table.is_empty())
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

    /// Release `key`: pass ownership to the next queued waiter, or clear the
    /// held flag and drop the entry when nobody else references it.
    fn release(&self, key: &K) {
        let (woken, drained) = {
            let mut state = self.state.lock();
            let mut woken = None;
            if let Some(entry) = state.table.get_mut(key) {
                entry.refs -= 1;
                match entry.queue.grant_next() {
                    // Ownership transfers; the entry stays held.
                    Some(waiter) => woken = Some(waiter),
                    None => {
                        entry.held = false;
                        if entry.refs == 0 {
                            state.table.remove(key);
                        }
                    }
                }
            }
            (woken, state.closed && state.table.is_empty())
        };
        if drained {
            self.drained.set();
        }
        if let Some(waiter) = woken {
            waiter.wake();
        }
    }

    /// Drop the table reference of a waiter that will never become a holder
    /// (cancelled or failed by close).
    fn forget_waiter(&self, key: &K) {
        let drained = {
            let mut state = self.state.lock();
            if let Some(entry) = state.table.get_mut(key) {
                entry.refs -= 1;
                entry.queue.prune();
                if entry.refs == 0 && !entry.held {
                    state.table.remove(key);
                }
            }
            state.closed && state.table.is_empty()
        };
        if drained {
            self.drained.set();
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one key; releasing it unlocks the key and may remove the
/// table entry.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    lock: &'a KeyedLock<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> KeyedGuard<'_, K> {
    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

/// Future returned by [`KeyedLock::lock`].
pub struct LockKey<'a, K: Eq + Hash + Clone> {
    lock: &'a KeyedLock<K>,
    key: Option<K>,
    waiter: Option<Arc<Waiter>>,
}

// Sound: the future is never pinned structurally; no field is pin-projected.
impl<K: Eq + Hash + Clone> Unpin for LockKey<'_, K> {}

impl<'a, K: Eq + Hash + Clone> Future for LockKey<'a, K> {
    type Output = Result<KeyedGuard<'a, K>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = &this.waiter {
                return match waiter.poll_wait(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(WaitState::Granted) => {
                        this.waiter = None;
                        let key = this.key.take().expect("lock future polled after completion");
                        Poll::Ready(Ok(KeyedGuard {
                            lock: this.lock,
                            key,
                        }))
                    }
                    Poll::Ready(terminal) => {
                        this.waiter = None;
                        let key = this.key.take().expect("lock future polled after completion");
                        this.lock.forget_waiter(&key);
                        Poll::Ready(Err(match terminal {
                            WaitState::Closed => Error::Closed,
                            _ => Error::Cancelled,
                        }))
                    }
                };
            }

            let waiter = {
                let key = this.key.as_ref().expect("lock future polled after completion");
                let mut state = this.lock.state.lock();
                if state.closed {
                    return Poll::Ready(Err(Error::Closed));
                }
                let entry = state.table.entry(key.clone()).or_insert_with(KeyEntry::new);
                entry.refs += 1;
                if !entry.held {
                    entry.held = true;
                    drop(state);
                    let key = this.key.take().expect("lock future polled after completion");
                    return Poll::Ready(Ok(KeyedGuard {
                        lock: this.lock,
                        key,
                    }));
                }
                let waiter = Waiter::new();
                entry.queue.push(waiter.clone());
                waiter
            };
            this.waiter = Some(waiter);
        }
    }
}

impl<K: Eq + Hash + Clone> Drop for LockKey<'_, K> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let key = match self.key.take() {
                Some(key) => key,
                None => return,
            };
            if waiter.try_complete(WaitState::Cancelled) {
                self.lock.forget_waiter(&key);
            } else if waiter.wait_terminal() == WaitState::Granted {
                // Granted in the race with this drop: release on behalf of
                // the caller who will never see the guard.
                self.lock.release(&key);
            } else {
                self.lock.forget_waiter(&key);
            }
        }
    }
}
