//! AsyncRetryer integration tests on tokio's paused clock

use pacer::{AsyncRetryer, PacerError, RetryOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_follow_schedule() {
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let times_clone = attempt_times.clone();
    let epoch = tokio::time::Instant::now();

    let retryer = AsyncRetryer::new(
        RetryOptions::default()
            .with_max_attempts(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_multiplier(2.0),
    );

    let result: Result<(), _> = retryer
        .execute(move |_token| {
            let times = times_clone.clone();
            let at = tokio::time::Instant::now() - epoch;
            async move {
                times.lock().unwrap().push(at);
                anyhow::bail!("still failing")
            }
        })
        .await;

    assert!(result.is_err());
    // attempts at 0, +100, +200, +400
    assert_eq!(
        *attempt_times.lock().unwrap(),
        vec![
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(700),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_on_retry_fires_between_attempts() {
    let retries_seen = Arc::new(Mutex::new(Vec::new()));
    let retries_clone = retries_seen.clone();

    let retryer = AsyncRetryer::new(
        RetryOptions::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_on_retry(move |attempt| retries_clone.lock().unwrap().push(attempt)),
    );

    let _: Result<(), _> = retryer
        .execute(|_token| async { anyhow::bail!("no") })
        .await;

    assert_eq!(*retries_seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_serial_executions_queue_up() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let retryer = AsyncRetryer::new(RetryOptions::default());

    let mut handles = Vec::new();
    for _ in 0..3 {
        let retryer = retryer.clone();
        let running = running.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            retryer
                .execute(move |_token| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // one retryer never overlaps its own executions
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_attempt() {
    let retryer = AsyncRetryer::new(RetryOptions::default().with_max_attempts(3));

    let handle = {
        let retryer = retryer.clone();
        tokio::spawn(async move {
            let result: Result<(), PacerError> = retryer
                .execute(|_token| async move {
                    // an operation that never finishes on its own
                    std::future::pending::<()>().await;
                    unreachable!()
                })
                .await;
            result
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    retryer.abort();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(PacerError::Aborted)));
    assert!(!retryer.is_executing());
}
