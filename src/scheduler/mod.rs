//! Injected timer capability
//!
//! All timers in the core go through a [`TimerScheduler`] so tests can run
//! virtual time; there are no direct wall-clock timers anywhere else.
//!
//! | Implementation | Description |
//! |----------------|-------------|
//! | [`TokioScheduler`] | One spawned `tokio::time::sleep` per timer; abort on cancel |
//! | [`VirtualScheduler`] | Manual clock for runtime-free deterministic tests |
//!
//! Timers are single-shot; re-arming is the caller's responsibility.

mod tokio_scheduler;
mod virtual_scheduler;

pub use tokio_scheduler::TokioScheduler;
pub use virtual_scheduler::VirtualScheduler;

use std::sync::Arc;
use std::time::Duration;

/// Boxed one-shot timer callback
pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// One-shot timer scheduler plus a monotonic clock
pub trait TimerScheduler: Send + Sync {
    /// Monotonic time elapsed since the scheduler's epoch
    fn now(&self) -> Duration;

    /// Arm a single-shot timer firing `task` after `delay`
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId;

    /// Cancel a previously armed timer; unknown ids are ignored
    fn cancel(&self, id: TimerId);
}

/// Await a delay through the injected scheduler.
///
/// Completes when the scheduled timer fires. With a paused tokio clock this
/// advances virtually like any other sleep.
pub async fn sleep(scheduler: &Arc<dyn TimerScheduler>, delay: Duration) {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    scheduler.schedule(
        delay,
        Box::new(move || {
            let _ = tx.send(());
        }),
    );
    let _ = rx.await;
}
