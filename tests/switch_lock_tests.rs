//! Integration tests for SwitchLock

use compio_coord::{Error, SwitchLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[compio::test]
async fn test_same_side_holders_share() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = SwitchLock::new();
        let a = lock.lock_left().await.unwrap();
        let b = lock.lock_left().await.unwrap();
        let c = lock.lock_left().await.unwrap();
        assert!(lock.is_left());
        drop(a);
        drop(b);
        assert!(lock.is_left());
        drop(c);
        assert!(!lock.is_left());
        assert!(!lock.is_right());
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_opposite_side_waits() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new());
        let left = lock.lock_left().await.unwrap();

        let right_done = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = lock.clone();
            let right_done = right_done.clone();
            compio::runtime::spawn(async move {
                let _guard = lock.lock_right().await.unwrap();
                right_done.store(true, Ordering::Release);
            })
        };

        compio::time::sleep(Duration::from_millis(10)).await;
        assert!(!right_done.load(Ordering::Acquire));
        assert_eq!(lock.waiting_right(), 1);

        drop(left);
        handle.await.unwrap();
        assert!(right_done.load(Ordering::Acquire));
        assert_eq!(lock.waiting_right(), 0);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_fair_mode_defers_to_opposite_waiters() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Take Left
        let first_left = lock.lock_left().await.unwrap();

        // Enqueue Right
        let right = {
            let lock = lock.clone();
            let order = order.clone();
            compio::runtime::spawn(async move {
                let guard = lock.lock_right().await.unwrap();
                order.lock().unwrap().push("right");
                compio::time::sleep(Duration::from_millis(20)).await;
                drop(guard);
            })
        };
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock.waiting_right(), 1);

        // Enqueue a second Left while Right is pending: fair mode defers it
        let second_left = {
            let lock = lock.clone();
            let order = order.clone();
            compio::runtime::spawn(async move {
                let _guard = lock.lock_left().await.unwrap();
                order.lock().unwrap().push("left");
            })
        };
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock.waiting_left(), 1);

        // Release the first Left: Right goes first, then the second Left
        drop(first_left);
        right.await.unwrap();
        second_left.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["right", "left"]);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_unfair_mode_admits_active_side_past_waiters() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new_unfair());

        let first_left = lock.lock_left().await.unwrap();

        let right_done = Arc::new(AtomicBool::new(false));
        let right = {
            let lock = lock.clone();
            let right_done = right_done.clone();
            compio::runtime::spawn(async move {
                let _guard = lock.lock_right().await.unwrap();
                right_done.store(true, Ordering::Release);
            })
        };
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock.waiting_right(), 1);

        // Unfair: the second Left is admitted immediately, right still waits
        let second_left = lock.lock_left().await.unwrap();
        assert!(!right_done.load(Ordering::Acquire));

        drop(first_left);
        drop(second_left);
        right.await.unwrap();
        assert!(right_done.load(Ordering::Acquire));
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_cancelled_opposite_waiter_readmits_same_side() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new());
        let first_left = lock.lock_left().await.unwrap();

        // Right waiter with a deadline, then a Left waiter queued behind it
        let right = {
            let lock = lock.clone();
            compio::runtime::spawn(
                async move { lock.lock_right_timeout(Duration::from_millis(20)).await.err() },
            )
        };
        compio::time::sleep(Duration::from_millis(5)).await;

        let second_left = {
            let lock = lock.clone();
            compio::runtime::spawn(async move {
                let _guard = lock.lock_left().await.unwrap();
            })
        };
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(lock.waiting_left(), 1);

        // The right waiter expires; the queued Left joins the active side
        // even though the first Left still holds the lock
        assert_eq!(right.await.unwrap(), Some(Error::TimedOut));
        second_left.await.unwrap();
        assert!(lock.is_left());

        drop(first_left);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_side_flips_grant_whole_queue() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new());
        let left = lock.lock_left().await.unwrap();

        let mut rights = vec![];
        for _ in 0..3 {
            let lock = lock.clone();
            rights.push(compio::runtime::spawn(async move {
                let _guard = lock.lock_right().await.unwrap();
                // All three hold the right side together
                compio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock.waiting_right(), 3);

        drop(left);
        for right in rights {
            right.await.unwrap();
        }
        assert!(!lock.is_right());
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_close_fails_waiters_then_drains() {
    compio::time::timeout(Duration::from_secs(5), async {
        let lock = Arc::new(SwitchLock::new());
        let left = lock.lock_left().await.unwrap();

        let right = {
            let lock = lock.clone();
            compio::runtime::spawn(async move { lock.lock_right().await.err() })
        };
        compio::time::sleep(Duration::from_millis(10)).await;

        let closed = Arc::new(AtomicBool::new(false));
        let closer = {
            let lock = lock.clone();
            let closed = closed.clone();
            compio::runtime::spawn(async move {
                lock.close().await;
                closed.store(true, Ordering::Release);
            })
        };

        assert_eq!(right.await.unwrap(), Some(Error::Closed));
        compio::time::sleep(Duration::from_millis(10)).await;
        assert!(!closed.load(Ordering::Acquire));

        drop(left);
        closer.await.unwrap();
        assert_eq!(lock.lock_left().await.err(), Some(Error::Closed));
    })
    .await
    .expect("test timed out");
}
