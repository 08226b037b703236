//! Manual-clock scheduler for deterministic tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use super::{TimerId, TimerScheduler, TimerTask};
use crate::lock::lock_or_recover;

struct VirtualQueue {
    now: Duration,
    seq: u64,
    /// (fire_at, seq) keeps same-instant timers in arm order
    by_deadline: BTreeMap<(Duration, u64), TimerTask>,
    index: HashMap<TimerId, (Duration, u64)>,
}

/// Scheduler driven by an explicit [`advance`](VirtualScheduler::advance)
/// call instead of a wall clock.
///
/// Due callbacks run in fire-time order, with the clock set to each timer's
/// fire time while its callback runs, so cascading timers (a callback arming
/// another timer inside the advanced span) fire in the same pass.
///
/// # Example
///
/// ```rust,ignore
/// use pacer::scheduler::{TimerScheduler, VirtualScheduler};
/// use std::time::Duration;
///
/// let clock = VirtualScheduler::new();
/// clock.schedule(Duration::from_millis(500), Box::new(|| println!("fired")));
/// clock.advance(Duration::from_millis(500)); // prints "fired"
/// ```
pub struct VirtualScheduler {
    queue: Mutex<VirtualQueue>,
}

impl VirtualScheduler {
    /// Create a scheduler with its clock at zero
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VirtualQueue {
                now: Duration::ZERO,
                seq: 0,
                by_deadline: BTreeMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Move the clock forward by `delta`, running every timer that becomes
    /// due. Callbacks run outside the internal lock, so they may schedule
    /// and cancel freely.
    pub fn advance(&self, delta: Duration) {
        let target = lock_or_recover(&self.queue).now + delta;
        loop {
            let task = {
                let mut queue = lock_or_recover(&self.queue);
                let next_key = queue.by_deadline.first_key_value().map(|(&key, _)| key);
                match next_key {
                    Some((fire_at, seq)) if fire_at <= target => {
                        let task = queue.by_deadline.remove(&(fire_at, seq));
                        queue.index.remove(&TimerId(seq));
                        queue.now = fire_at.max(queue.now);
                        task
                    }
                    _ => {
                        queue.now = target;
                        None
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Number of timers currently armed
    pub fn pending_timers(&self) -> usize {
        lock_or_recover(&self.queue).index.len()
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler for VirtualScheduler {
    fn now(&self) -> Duration {
        lock_or_recover(&self.queue).now
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let mut queue = lock_or_recover(&self.queue);
        queue.seq += 1;
        let seq = queue.seq;
        let key = (queue.now + delay, seq);
        queue.by_deadline.insert(key, task);
        queue.index.insert(TimerId(seq), key);
        TimerId(seq)
    }

    fn cancel(&self, id: TimerId) {
        let mut queue = lock_or_recover(&self.queue);
        if let Some(key) = queue.index.remove(&id) {
            queue.by_deadline.remove(&key);
        }
    }
}
