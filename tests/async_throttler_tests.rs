//! Async throttler integration tests on tokio's paused clock

use pacer::{AsyncThrottler, AsyncThrottlerOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_two_executions_for_a_burst() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let t: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        move |v: u32, _token| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            }
        },
        AsyncThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    // leading execution
    assert_eq!(t.maybe_execute(1).await.unwrap(), Some(1));

    // burst inside the window: only the last offer executes, on the edge
    let mut handles = Vec::new();
    for v in [2, 3, 4] {
        let t = t.clone();
        handles.push(tokio::spawn(async move { t.maybe_execute(v).await }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut resolved = Vec::new();
    for handle in handles {
        resolved.push(handle.await.unwrap().unwrap());
    }
    // superseded offers resolved with the last completed result (1);
    // the final offer awaited the trailing execution (4)
    assert_eq!(resolved, vec![Some(1), Some(1), Some(4)]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_spacing_is_at_least_wait() {
    let times = Arc::new(std::sync::Mutex::new(Vec::new()));
    let times_clone = times.clone();
    let epoch = tokio::time::Instant::now();
    let t: AsyncThrottler<u32, ()> = AsyncThrottler::new(
        move |_v: u32, _token| {
            let times = times_clone.clone();
            let at = tokio::time::Instant::now() - epoch;
            async move {
                times.lock().unwrap().push(at);
                Ok(())
            }
        },
        AsyncThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    for v in 0..5 {
        let _ = t.maybe_execute(v).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let times = times.lock().unwrap();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(100));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_resolves_pending_with_none() {
    let t: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |v: u32, _token| async move { Ok(v) },
        AsyncThrottlerOptions::default().with_wait(Duration::from_secs(60)),
    );

    assert_eq!(t.maybe_execute(1).await.unwrap(), Some(1));

    let pending = {
        let t = t.clone();
        tokio::spawn(async move { t.maybe_execute(2).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    t.cancel();

    assert_eq!(pending.await.unwrap().unwrap(), None);
    assert_eq!(t.get_state().success_count, 1);
}
