//! Async batcher integration tests on tokio's paused clock

use pacer::{AsyncBatcher, AsyncBatcherOptions, DeduplicateStrategy, RetryOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_time_trigger_executes_spawned_batch() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batches_clone = batches.clone();
    let b: AsyncBatcher<u32, usize> = AsyncBatcher::new(
        move |batch: Vec<u32>, _token| {
            let batches = batches_clone.clone();
            async move {
                let len = batch.len();
                batches.lock().unwrap().push(batch);
                Ok(len)
            }
        },
        AsyncBatcherOptions::default().with_wait(Duration::from_millis(100)),
    );

    b.add_item(1);
    tokio::time::sleep(Duration::from_millis(40)).await;
    b.add_item(2);
    assert!(b.is_pending());

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(batches.lock().unwrap().as_slice(), [vec![1, 2]]);
    assert_eq!(b.get_state().success_count, 1);
    assert!(!b.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_flush_returns_result_and_respects_dedup() {
    let b: AsyncBatcher<u32, u32> = AsyncBatcher::new(
        |batch: Vec<u32>, _token| async move { Ok(batch.iter().sum()) },
        AsyncBatcherOptions::default()
            .with_deduplicate_items(true)
            .with_deduplicate_strategy(DeduplicateStrategy::KeepLast),
    );

    b.add_item(5);
    b.add_item(7);
    b.add_item(5); // keep-last replaces in place
    assert_eq!(b.size(), 2);

    let total = b.flush().await.unwrap();
    assert_eq!(total, Some(12));
    assert_eq!(b.get_state().total_items_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_retries_then_succeeds() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let b: AsyncBatcher<u32, usize> = AsyncBatcher::new(
        move |batch: Vec<u32>, _token| {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("sink busy")
                }
                Ok(batch.len())
            }
        },
        AsyncBatcherOptions::default().with_retry(
            RetryOptions::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(10)),
        ),
    );

    b.add_item(1);
    b.add_item(2);
    let result = b.flush().await.unwrap();
    assert_eq!(result, Some(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(b.get_state().error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_settles_without_success() {
    let b: AsyncBatcher<u32, u32> = AsyncBatcher::new(
        |_batch: Vec<u32>, _token| async move {
            // an operation that never finishes on its own
            std::future::pending::<()>().await;
            unreachable!()
        },
        AsyncBatcherOptions::default(),
    );

    b.add_item(1);
    let flush = {
        let b = b.clone();
        tokio::spawn(async move { b.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    b.abort();

    assert_eq!(flush.await.unwrap().unwrap(), None);
    let state = b.get_state();
    assert_eq!(state.success_count, 0);
    assert_eq!(state.settle_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_batcher_accumulates_until_start() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batches_clone = batches.clone();
    let b: AsyncBatcher<u32, ()> = AsyncBatcher::new(
        move |batch: Vec<u32>, _token| {
            let batches = batches_clone.clone();
            async move {
                batches.lock().unwrap().push(batch);
                Ok(())
            }
        },
        AsyncBatcherOptions::default()
            .with_max_size(2)
            .with_started(false),
    );

    b.add_item(1);
    b.add_item(2);
    b.add_item(3);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(batches.lock().unwrap().is_empty());

    b.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(batches.lock().unwrap().as_slice(), [vec![1, 2, 3]]);
}
