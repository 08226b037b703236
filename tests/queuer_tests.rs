//! Queuer integration tests on virtual time

use pacer::scheduler::VirtualScheduler;
use pacer::{Position, Queuer, QueuerOptions, QueuerStatus};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn recording_queuer(
    clock: &Arc<VirtualScheduler>,
    options: QueuerOptions<u32>,
) -> (
    Arc<Mutex<Vec<(u32, Duration)>>>,
    Queuer<u32, impl FnMut(u32) + Send>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let inner_clock = clock.clone();
    let queuer = Queuer::new(
        move |v: u32| sink.lock().unwrap().push((v, inner_clock.now())),
        options.with_scheduler(clock.clone()),
    );
    (seen, queuer)
}

#[test]
fn test_initial_items_paced_one_per_wait() {
    // started, wait=1000, items 1..10: processed at 0, 1000, ..., 9000;
    // an item added mid-run processes at 10000
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, q) = recording_queuer(
        &clock,
        QueuerOptions::default()
            .with_wait(Duration::from_millis(1000))
            .with_max_size(25)
            .with_initial_items((1..=10).collect()),
    );

    clock.advance(Duration::from_millis(4500));
    assert!(q.add_item(11));

    clock.advance(Duration::from_millis(10000) - clock.now());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 11);
    for (i, &(v, at)) in seen.iter().enumerate() {
        assert_eq!(v as usize, i + 1);
        assert_eq!(at, Duration::from_millis(1000 * i as u64));
    }
}

#[test]
fn test_fifo_and_lifo_and_deque() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, q) = recording_queuer(&clock, QueuerOptions::default().with_started(false));

    q.add_item(1);
    q.add_item(2);
    q.add_item_to(3, Position::Front);
    assert_eq!(q.peek_all_items(), vec![3, 1, 2]);
    assert_eq!(q.peek_next_item(), Some(3));
    assert_eq!(q.peek_next_item_from(Position::Back), Some(2));

    q.flush();
    assert_eq!(
        seen.lock().unwrap().iter().map(|p| p.0).collect::<Vec<_>>(),
        vec![3, 1, 2]
    );
}

#[test]
fn test_priority_serves_highest_first_stable() {
    let clock = Arc::new(VirtualScheduler::new());
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = processed.clone();
    let q = Queuer::new(
        move |v: (u32, i64)| sink.lock().unwrap().push(v),
        QueuerOptions::default()
            .with_started(false)
            .with_get_priority(|item: &(u32, i64)| item.1)
            .with_scheduler(clock.clone()),
    );

    // (id, priority)
    q.add_item((1, 5));
    q.add_item((2, 9));
    q.add_item((3, 5));
    q.add_item((4, 1));
    q.flush();

    let processed = processed.lock().unwrap();
    assert_eq!(*processed, vec![(2, 9), (1, 5), (3, 5), (4, 1)]);
    // non-increasing priority, equal priorities in admission order
    for pair in processed.windows(2) {
        assert!(pair[0].1 >= pair[1].1);
    }
}

#[test]
fn test_conservation_of_items() {
    // admitted - processed - expired - cleared == queue length
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, q) = recording_queuer(
        &clock,
        QueuerOptions::default()
            .with_started(false)
            .with_max_size(8)
            .with_expiration_duration(Duration::from_millis(50)),
    );

    let mut admitted = 0;
    for v in 0..12 {
        if q.add_item(v) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 8);

    let _ = q.execute();
    let _ = q.execute();
    clock.advance(Duration::from_millis(100));
    q.start(); // purges the aged-out remainder

    let state = q.get_state();
    let processed = seen.lock().unwrap().len();
    assert_eq!(
        admitted - processed - state.expiration_count,
        state.size,
        "conservation violated"
    );
    assert_eq!(state.rejection_count, 4);
}

#[test]
fn test_custom_expiration_predicate() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, q) = recording_queuer(
        &clock,
        QueuerOptions::default()
            .with_started(false)
            .with_get_is_expired(|item, _added_at| *item % 2 == 0),
    );

    for v in 1..=6 {
        q.add_item(v);
    }
    q.start();

    assert_eq!(
        seen.lock().unwrap().iter().map(|p| p.0).collect::<Vec<_>>(),
        vec![1, 3, 5]
    );
    assert_eq!(q.get_state().expiration_count, 3);
}

#[test]
fn test_flush_as_batch_hands_over_everything() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, q) = recording_queuer(&clock, QueuerOptions::default().with_started(false));

    q.add_item(1);
    q.add_item(2);
    q.add_item(3);

    let batch = Arc::new(Mutex::new(Vec::new()));
    let batch_clone = batch.clone();
    q.flush_as_batch(move |items| {
        *batch_clone.lock().unwrap() = items;
    });

    assert_eq!(*batch.lock().unwrap(), vec![1, 2, 3]);
    assert!(q.is_empty());
    assert_eq!(q.execution_count(), 1);
}

#[test]
fn test_clear_keeps_counters_reset_drops_them() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, q) = recording_queuer(
        &clock,
        QueuerOptions::default()
            .with_started(false)
            .with_initial_items(vec![1, 2]),
    );

    let _ = q.execute();
    assert_eq!(q.execution_count(), 1);

    q.add_item(3);
    q.clear();
    assert!(q.is_empty());
    assert_eq!(q.execution_count(), 1);

    q.reset(true);
    assert_eq!(q.execution_count(), 0);
    assert_eq!(q.peek_all_items(), vec![1, 2]);

    q.reset(false);
    assert!(q.is_empty());
}

#[test]
fn test_status_reflects_running_and_ticks() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, q) = recording_queuer(
        &clock,
        QueuerOptions::default()
            .with_started(false)
            .with_wait(Duration::from_millis(100)),
    );

    assert_eq!(q.get_state().status, QueuerStatus::Stopped);
    q.start();
    assert_eq!(q.get_state().status, QueuerStatus::Idle);
    assert!(q.is_idle());

    q.add_item(1);
    // the wait timer keeps the tick chain alive
    assert_eq!(q.get_state().status, QueuerStatus::Busy);

    clock.advance(Duration::from_millis(100));
    assert_eq!(q.get_state().status, QueuerStatus::Idle);
}

#[test]
fn test_stop_and_start_round_trip() {
    let clock = Arc::new(VirtualScheduler::new());
    let running_changes = Arc::new(Mutex::new(Vec::new()));
    let changes = running_changes.clone();
    let q = Queuer::new(
        |_: u32| {},
        QueuerOptions::default()
            .with_wait(Duration::from_millis(100))
            .with_on_is_running_change(move |running| {
                changes.lock().unwrap().push(running);
            })
            .with_scheduler(clock.clone()),
    );

    q.add_item(1);
    q.add_item(2);
    q.stop();
    q.stop(); // idempotent
    clock.advance(Duration::from_millis(1000));
    assert_eq!(q.size(), 1);

    q.start();
    clock.advance(Duration::from_millis(1000));
    assert!(q.is_empty());
    assert_eq!(*running_changes.lock().unwrap(), vec![false, true]);
}
