//! Async debouncer integration tests on tokio's paused clock

use pacer::{AsyncDebouncer, AsyncDebouncerOptions, PacerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting_debouncer(
    wait: Duration,
    options: AsyncDebouncerOptions<String>,
) -> (Arc<AtomicUsize>, AsyncDebouncer<String, String>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let d = AsyncDebouncer::new(
        move |query: String, _token| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("results for {query}"))
            }
        },
        options.with_wait(wait),
    );
    (calls, d)
}

#[tokio::test(start_paused = true)]
async fn test_burst_resolves_every_caller_with_trailing_result() {
    let (calls, d) = counting_debouncer(
        Duration::from_millis(300),
        AsyncDebouncerOptions::default(),
    );

    let mut handles = Vec::new();
    for query in ["p", "pa", "pacer"] {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.maybe_execute(query.to_string()).await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.as_deref(), Some("results for pacer"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(d.get_state().settle_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_leading_burst_single_execution() {
    let (calls, d) = counting_debouncer(
        Duration::from_millis(100),
        AsyncDebouncerOptions::default().with_leading(true),
    );

    // a burst with exactly one offer fires once, on the leading edge
    let result = d.maybe_execute("solo".to_string()).await.unwrap();
    assert_eq!(result.as_deref(), Some("results for solo"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_resolves_early() {
    let (calls, d) = counting_debouncer(
        Duration::from_secs(60),
        AsyncDebouncerOptions::default(),
    );

    let waiter = {
        let d = d.clone();
        tokio::spawn(async move { d.maybe_execute("now".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let flushed = d.flush().await.unwrap();
    assert_eq!(flushed.as_deref(), Some("results for now"));
    assert_eq!(waiter.await.unwrap().unwrap().as_deref(), Some("results for now"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_counted_and_surfaced() {
    let failures = Arc::new(AtomicUsize::new(0));
    let failures_clone = failures.clone();
    let d: AsyncDebouncer<u32, u32> = AsyncDebouncer::new(
        |_v: u32, _token| async move { anyhow::bail!("backend down") },
        AsyncDebouncerOptions::default()
            .with_wait(Duration::from_millis(10))
            .with_on_error(move |_err: &PacerError| {
                failures_clone.fetch_add(1, Ordering::SeqCst);
            }),
    );

    // with an on_error handler the future resolves None instead of erroring
    assert_eq!(d.maybe_execute(1).await.unwrap(), None);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(d.get_state().error_count, 1);

    // forced throw overrides the handler default
    d.set_options(|o| o.throw_on_error = Some(true));
    assert!(d.maybe_execute(2).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_last_result_is_kept() {
    let (_, d) = counting_debouncer(
        Duration::from_millis(10),
        AsyncDebouncerOptions::default(),
    );

    d.maybe_execute("one".to_string()).await.unwrap();
    assert_eq!(d.peek_last_result().as_deref(), Some("results for one"));

    d.reset();
    assert_eq!(d.peek_last_result(), None);
}
