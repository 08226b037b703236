//! Throttler integration tests on virtual time

use pacer::scheduler::VirtualScheduler;
use pacer::{Throttler, ThrottlerOptions};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn recording_throttler(
    clock: &Arc<VirtualScheduler>,
    options: ThrottlerOptions,
) -> (
    Arc<Mutex<Vec<(char, Duration)>>>,
    Throttler<char, impl FnMut(char) + Send>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let inner_clock = clock.clone();
    let throttler = Throttler::new(
        move |v: char| sink.lock().unwrap().push((v, inner_clock.now())),
        options.with_scheduler(clock.clone()),
    );
    (seen, throttler)
}

#[test]
fn test_window_sequence_with_latest_args() {
    // wait=100: a at t=0 (leading), b/c/d inside the window, d at t=100
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    t.maybe_execute('a');
    clock.advance(Duration::from_millis(35));
    t.maybe_execute('b');
    clock.advance(Duration::from_millis(35));
    t.maybe_execute('c');
    t.maybe_execute('d');
    clock.advance(Duration::from_millis(30));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![('a', Duration::ZERO), ('d', Duration::from_millis(100))]
    );
    assert_eq!(t.execution_count(), 2);
}

#[test]
fn test_invocations_never_closer_than_wait() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    for _ in 0..50 {
        t.maybe_execute('x');
        clock.advance(Duration::from_millis(7));
    }
    clock.advance(Duration::from_millis(200));

    let seen = seen.lock().unwrap();
    for pair in seen.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(100));
    }
}

#[test]
fn test_trailing_only() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default()
            .with_wait(Duration::from_millis(100))
            .with_leading(false),
    );

    t.maybe_execute('a');
    assert!(seen.lock().unwrap().is_empty());
    clock.advance(Duration::from_millis(100));
    // deferred to the window edge even though the window was open
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].0, 'a');
}

#[test]
fn test_leading_only_drops_trailing() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default()
            .with_wait(Duration::from_millis(100))
            .with_trailing(false),
    );

    t.maybe_execute('a');
    t.maybe_execute('b');
    clock.advance(Duration::from_millis(500));

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].0, 'a');
}

#[test]
fn test_flush_fires_pending_now() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    t.maybe_execute('a');
    clock.advance(Duration::from_millis(10));
    t.maybe_execute('b');
    t.flush();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(seen.lock().unwrap()[1], ('b', Duration::from_millis(10)));

    // the flushed timer is gone
    clock.advance(Duration::from_millis(500));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_next_execution_time_tracks_window() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    assert_eq!(t.get_state().next_execution_time, None);
    t.maybe_execute('a');
    assert_eq!(
        t.get_state().next_execution_time,
        Some(Duration::from_millis(100))
    );
}

#[test]
fn test_reset_forgets_spacing() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
    );

    t.maybe_execute('a');
    t.reset();
    t.maybe_execute('b');

    // b fires on the leading edge because reset cleared last_execution_time
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(t.execution_count(), 1);
}

#[test]
fn test_disabled_throttler_ignores_offers() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, t) = recording_throttler(
        &clock,
        ThrottlerOptions::default()
            .with_wait(Duration::from_millis(100))
            .with_enabled(false),
    );

    t.maybe_execute('a');
    clock.advance(Duration::from_millis(500));
    assert!(seen.lock().unwrap().is_empty());
}
