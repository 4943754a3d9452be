//! Async coordination and scheduling primitives for the compio runtime
//!
//! This crate provides synchronization and scheduling primitives that are
//! compatible with the [compio](https://github.com/compio-rs/compio) async
//! runtime.
//!
//! # Primitives
//!
//! - [`Semaphore`] - Counting semaphore with strict FIFO waiters and async close
//! - [`Counter`] - Unbounded counter with consuming (`decrement`) and
//!   observing (`peek`) waiters, plus wait-on-any across counters
//! - [`KeyedLock`] - Per-key mutual exclusion with lazy entries
//! - [`SwitchLock`] - Two-color readers lock with fair or unfair admission
//! - [`TaskStream`] - Strict-FIFO serializer for asynchronous work units
//! - [`TaskFlag`] - Coalescing "pending work" callback scheduler
//!
//! Waits compose with [`CancellationToken`] for external abort and with the
//! `*_timeout` variants for deadlines; failures are values of the closed
//! [`Error`] enum.
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

mod cancellation;
mod counter;
mod error;
mod keyed_lock;
mod semaphore;
mod switch_lock;
mod task_flag;
mod task_stream;

// Shared substrate: waiter records, grant lists, one-way latch
mod latch;
mod wait_queue;

pub use cancellation::CancellationToken;
pub use counter::{Counter, Decrement, DecrementAny, Peek};
pub use error::Error;
pub use keyed_lock::{KeyedGuard, KeyedLock, LockKey};
pub use semaphore::{Acquire, Semaphore, SemaphorePermit};
pub use switch_lock::{LockSide, SwitchGuard, SwitchLock};
pub use task_flag::TaskFlag;
pub use task_stream::{QueuedTask, TaskStream};
