//! Tokio-backed timer scheduler

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{TimerId, TimerScheduler, TimerTask};
use crate::lock::lock_or_recover;

/// Scheduler backed by spawned `tokio::time::sleep` tasks.
///
/// `now()` is measured with `tokio::time::Instant`, so tests running under
/// `#[tokio::test(start_paused = true)]` get virtual time for free.
/// Scheduling requires a tokio runtime context.
pub struct TokioScheduler {
    epoch: tokio::time::Instant,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Create a scheduler with its epoch at the current instant
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
            next_id: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers currently armed
    pub fn pending_timers(&self) -> usize {
        lock_or_recover(&self.timers).len()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler for TokioScheduler {
    fn now(&self) -> Duration {
        tokio::time::Instant::now() - self.epoch
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timers = self.timers.clone();

        // Hold the registry lock across the spawn so the task cannot observe
        // the map before its own handle is inserted.
        let mut guard = lock_or_recover(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock_or_recover(&timers).remove(&id);
            task();
        });
        guard.insert(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(handle) = lock_or_recover(&self.timers).remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in lock_or_recover(&self.timers).drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = fired.clone();
        scheduler.schedule(
            Duration::from_millis(100),
            Box::new(move || fired_clone.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = fired.clone();
        let id = scheduler.schedule(
            Duration::from_millis(100),
            Box::new(move || fired_clone.store(true, Ordering::SeqCst)),
        );
        scheduler.cancel(id);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_tracks_paused_clock() {
        let scheduler = TokioScheduler::new();
        let before = scheduler.now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(scheduler.now() - before, Duration::from_millis(250));
    }
}
