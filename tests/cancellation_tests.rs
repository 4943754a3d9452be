//! Integration tests for CancellationToken against the wait primitives

use compio_coord::{CancellationToken, Counter, Error, Semaphore};
use std::sync::Arc;
use std::time::Duration;

#[compio::test]
async fn test_cancel_wakes_async_observer() {
    compio::time::timeout(Duration::from_secs(5), async {
        let token = CancellationToken::new();
        let observer = {
            let token = token.clone();
            compio::runtime::spawn(async move {
                token.cancelled().await;
                "observed"
            })
        };

        compio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(observer.await.unwrap(), "observed");
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_cancelling_a_waiting_decrement() {
    compio::time::timeout(Duration::from_secs(5), async {
        let counter = Arc::new(Counter::new());
        let token = CancellationToken::new();

        let handle = {
            let counter = counter.clone();
            let token = token.clone();
            compio::runtime::spawn(
                async move { token.run_until_cancelled(counter.decrement()).await },
            )
        };

        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.waiting_count(), 1);
        token.cancel();

        assert_eq!(handle.await.unwrap().err(), Some(Error::Cancelled));
        assert_eq!(counter.waiting_count(), 0);

        // The retired waiter must not swallow the next unit
        counter.increment().unwrap();
        assert_eq!(counter.value(), 1);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn test_cancellation_does_not_disturb_other_waiters() {
    compio::time::timeout(Duration::from_secs(5), async {
        let sem = Arc::new(Semaphore::new(1));
        let permit = sem.acquire().await.unwrap();

        let token = CancellationToken::new();
        let cancelled = {
            let sem = sem.clone();
            let token = token.clone();
            compio::runtime::spawn(async move {
                match token.run_until_cancelled(sem.acquire()).await {
                    Ok(Ok(_permit)) => None,
                    Ok(Err(e)) | Err(e) => Some(e),
                }
            })
        };
        compio::time::sleep(Duration::from_millis(5)).await;

        let survivor = {
            let sem = sem.clone();
            compio::runtime::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                "survived"
            })
        };
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sem.waiting_count(), 2);

        token.cancel();
        assert_eq!(cancelled.await.unwrap(), Some(Error::Cancelled));
        assert_eq!(sem.waiting_count(), 1);

        // The release skips the cancelled head and serves the survivor
        drop(permit);
        assert_eq!(survivor.await.unwrap(), "survived");
        assert_eq!(sem.available_permits(), 1);
    })
    .await
    .expect("test timed out");
}
