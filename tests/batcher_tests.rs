//! Batcher integration tests on virtual time

use pacer::scheduler::VirtualScheduler;
use pacer::{Batcher, BatcherOptions, DeduplicateStrategy};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn recording_batcher(
    clock: &Arc<VirtualScheduler>,
    options: BatcherOptions<u32>,
) -> (
    Arc<Mutex<Vec<(Vec<u32>, Duration)>>>,
    Batcher<u32, impl FnMut(Vec<u32>) + Send>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let inner_clock = clock.clone();
    let batcher = Batcher::new(
        move |batch: Vec<u32>| sink.lock().unwrap().push((batch, inner_clock.now())),
        options.with_scheduler(clock.clone()),
    );
    (seen, batcher)
}

fn scenario_options() -> BatcherOptions<u32> {
    // maxSize=5, wait=3000, predicate fires when the batch contains 42
    BatcherOptions::default()
        .with_max_size(5)
        .with_wait(Duration::from_millis(3000))
        .with_get_should_execute(|items, _state| items.contains(&42))
}

#[test]
fn test_timer_then_size_then_predicate_triggers() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, b) = recording_batcher(&clock, scenario_options());

    // time trigger: adds at t=0, 1000, 2000 fire at t=3000 with [1,2,3]
    b.add_item(1);
    clock.advance(Duration::from_millis(1000));
    b.add_item(2);
    clock.advance(Duration::from_millis(1000));
    b.add_item(3);
    clock.advance(Duration::from_millis(1000));
    assert_eq!(
        seen.lock().unwrap().last().unwrap(),
        &(vec![1, 2, 3], Duration::from_millis(3000))
    );

    // size trigger: five rapid adds execute immediately
    b.reset();
    for v in 1..=5 {
        b.add_item(v);
    }
    assert_eq!(seen.lock().unwrap().last().unwrap().0, vec![1, 2, 3, 4, 5]);

    // predicate trigger: [7, 42] executes on the 42
    b.reset();
    b.add_item(7);
    b.add_item(42);
    assert_eq!(seen.lock().unwrap().last().unwrap().0, vec![7, 42]);
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn test_no_batch_exceeds_max_size() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, b) = recording_batcher(&clock, BatcherOptions::default().with_max_size(4));

    for v in 0..23 {
        b.add_item(v);
    }
    b.flush();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    for (batch, _) in seen.iter() {
        assert!(batch.len() <= 4);
    }
    assert_eq!(b.total_items_processed(), 23);
}

#[test]
fn test_timer_is_not_rearmed_by_later_admissions() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, b) = recording_batcher(
        &clock,
        BatcherOptions::default().with_wait(Duration::from_millis(100)),
    );

    b.add_item(1);
    clock.advance(Duration::from_millis(90));
    b.add_item(2);
    clock.advance(Duration::from_millis(10));

    // fires 100ms after the first admission
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [(vec![1, 2], Duration::from_millis(100))]
    );
}

#[test]
fn test_dedup_keep_first_preserves_first_seen_order() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, b) = recording_batcher(
        &clock,
        BatcherOptions::default().with_deduplicate_items(true),
    );

    for v in [3, 1, 3, 2, 1, 3] {
        b.add_item(v);
    }

    assert_eq!(b.peek_all_items(), vec![3, 1, 2]);
    assert_eq!(b.get_state().rejection_count, 3);
}

#[test]
fn test_dedup_keyed_keep_last() {
    let clock = Arc::new(VirtualScheduler::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let b = Batcher::new(
        move |batch: Vec<(char, u32)>| sink.lock().unwrap().push(batch),
        BatcherOptions::default()
            .with_deduplicate_items(true)
            .with_deduplicate_strategy(DeduplicateStrategy::KeepLast)
            .with_get_item_key(|item: &(char, u32)| item.0.to_string())
            .with_scheduler(clock),
    );

    b.add_item(('a', 1));
    b.add_item(('b', 2));
    b.add_item(('a', 99));
    b.flush();

    assert_eq!(seen.lock().unwrap().as_slice(), [vec![('a', 99), ('b', 2)]]);
}

#[test]
fn test_cancel_keeps_items_clear_drops_them() {
    let clock = Arc::new(VirtualScheduler::new());
    let (seen, b) = recording_batcher(
        &clock,
        BatcherOptions::default().with_wait(Duration::from_millis(100)),
    );

    b.add_item(1);
    assert!(b.is_pending());
    b.cancel();
    assert!(!b.is_pending());
    assert_eq!(b.peek_all_items(), vec![1]);

    clock.advance(Duration::from_millis(500));
    assert!(seen.lock().unwrap().is_empty());

    b.clear();
    assert!(b.is_empty());
    b.flush();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_items_snapshot_cleared_before_operation_settles() {
    let clock = Arc::new(VirtualScheduler::new());
    let (_, b) = recording_batcher(&clock, BatcherOptions::default().with_max_size(2));

    let observed_size = Arc::new(Mutex::new(None));
    let observed = observed_size.clone();
    let handle = b.clone();
    b.set_options(move |o| {
        o.on_execute = Some(Arc::new(move |_batch: &[u32]| {
            *observed.lock().unwrap() = Some(handle.size());
        }));
    });

    b.add_item(1);
    b.add_item(2);

    // the pending batch was already empty when the batch ran
    assert_eq!(*observed_size.lock().unwrap(), Some(0));
}

#[test]
fn test_on_execute_and_items_change_callbacks() {
    let clock = Arc::new(VirtualScheduler::new());
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executed_clone = executed.clone();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes_clone = sizes.clone();

    let b = Batcher::new(
        |_batch: Vec<u32>| {},
        BatcherOptions::default()
            .with_max_size(2)
            .with_on_execute(move |batch| executed_clone.lock().unwrap().push(batch.to_vec()))
            .with_on_items_change(move |items| sizes_clone.lock().unwrap().push(items.len()))
            .with_scheduler(clock),
    );

    b.add_item(1);
    b.add_item(2);

    assert_eq!(executed.lock().unwrap().as_slice(), [vec![1, 2]]);
    // one admission, then the trigger emptied the batch
    assert_eq!(sizes.lock().unwrap().as_slice(), [1, 0]);
}
