//! Throttler: at most one invocation per wait window
//!
//! A throttler guarantees that successive invocations of the wrapped
//! operation are spaced at least `wait` apart. The leading edge fires as
//! soon as the window allows; offers landing inside the window are deferred
//! to the trailing edge, which fires with the latest arguments seen.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{Throttler, ThrottlerOptions};
//! use std::time::Duration;
//!
//! let scroll = Throttler::new(
//!     |position: u32| update_scrollbar(position),
//!     ThrottlerOptions::default().with_wait(Duration::from_millis(100)),
//! );
//!
//! // Called on every scroll event; runs at most once per 100ms.
//! scroll.maybe_execute(42);
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Execution status of a throttler
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThrottlerStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// No trailing invocation is scheduled
    #[default]
    Idle,
    /// A trailing invocation is waiting on the window timer
    Pending,
}

/// Read-only throttler state snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottlerState {
    /// Scheduler time of the most recent invocation
    pub last_execution_time: Option<Duration>,
    /// Earliest scheduler time the next leading invocation may run
    pub next_execution_time: Option<Duration>,
    /// Whether a trailing invocation is scheduled
    pub is_pending: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Number of completed invocations
    pub execution_count: usize,
    /// Derived status
    pub status: ThrottlerStatus,
}

impl DerivedState for ThrottlerState {
    fn recompute(&mut self) {
        self.status = if !self.is_enabled {
            ThrottlerStatus::Disabled
        } else if self.is_pending {
            ThrottlerStatus::Pending
        } else {
            ThrottlerStatus::Idle
        };
    }
}

fn default_state() -> ThrottlerState {
    ThrottlerState {
        is_enabled: true,
        ..ThrottlerState::default()
    }
}

/// Throttler configuration
#[derive(Clone)]
pub struct ThrottlerOptions {
    /// Minimum spacing between invocations
    pub wait: Setting<Duration, ThrottlerState>,
    /// Fire immediately when the window allows (default true)
    pub leading: bool,
    /// Fire deferred offers at the end of the window (default true)
    pub trailing: bool,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, ThrottlerState>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&ThrottlerState) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<ThrottlerState>,
}

impl Default for ThrottlerOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(100).into(),
            leading: true,
            trailing: true,
            enabled: true.into(),
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
            initial_state: None,
        }
    }
}

impl ThrottlerOptions {
    /// Set the window width
    pub fn with_wait(mut self, wait: impl Into<Setting<Duration, ThrottlerState>>) -> Self {
        self.wait = wait.into();
        self
    }

    /// Fire on the leading edge of the window
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Fire on the trailing edge of the window
    pub fn with_trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, ThrottlerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Identify this instance to the observer
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Register a state-change callback
    pub fn with_on_state_change(
        mut self,
        f: impl Fn(&ThrottlerState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Attach a change-notification sink
    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Inject a timer scheduler
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TimerScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Start from a non-default state
    pub fn with_initial_state(mut self, state: ThrottlerState) -> Self {
        self.initial_state = Some(state);
        self
    }
}

struct ThrottlerCore<A> {
    options: ThrottlerOptions,
    last_args: Option<A>,
    timer: Option<TimerId>,
    timer_epoch: u64,
}

struct ThrottlerInner<A, F> {
    op: Mutex<Option<F>>,
    core: Mutex<ThrottlerCore<A>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<ThrottlerState>,
}

/// Guarantees at most one invocation per `wait` window.
///
/// Cheap to clone; clones share the same state.
pub struct Throttler<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    inner: Arc<ThrottlerInner<A, F>>,
}

impl<A, F> Clone for Throttler<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, F> Throttler<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    /// Create a throttler around `op`
    pub fn new(op: F, options: ThrottlerOptions) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let initial = options.initial_state.clone().unwrap_or_else(default_state);
        Self {
            inner: Arc::new(ThrottlerInner {
                op: Mutex::new(Some(op)),
                core: Mutex::new(ThrottlerCore {
                    options,
                    last_args: None,
                    timer: None,
                    timer_epoch: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Offer arguments; fires now (leading) or at the window edge (trailing)
    pub fn maybe_execute(&self, args: A) {
        ThrottlerInner::offer(&self.inner, args);
    }

    /// Execute a pending trailing invocation immediately
    pub fn flush(&self) {
        let args = {
            let mut core = lock_or_recover(&self.inner.core);
            if self.inner.state.with(|s| s.is_pending) {
                ThrottlerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
                self.inner.state.update(|s| s.is_pending = false);
                core.last_args.take()
            } else {
                None
            }
        };
        if let Some(args) = args {
            self.inner.execute(args);
        }
        self.inner.publish();
    }

    /// Abandon the pending trailing invocation; window spacing is kept
    pub fn cancel(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            ThrottlerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
        }
        self.inner.state.update(|s| s.is_pending = false);
        self.inner.publish();
    }

    /// Cancel and restore the default state (counters and spacing included)
    pub fn reset(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            ThrottlerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
        }
        self.inner.state.replace(default_state());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut ThrottlerOptions)) {
        let disabled = {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                ThrottlerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
                core.last_args = None;
            }
            !enabled
        };
        if disabled {
            self.inner.state.update(|s| s.is_pending = false);
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> ThrottlerState {
        self.inner.state.get()
    }

    /// Register a change callback
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe(f)
    }

    /// Whether a trailing invocation is scheduled
    pub fn is_pending(&self) -> bool {
        self.inner.state.with(|s| s.is_pending)
    }

    /// Number of completed invocations
    pub fn execution_count(&self) -> usize {
        self.inner.state.with(|s| s.execution_count)
    }

    /// Arguments the trailing edge would fire with
    pub fn peek_last_args(&self) -> Option<A> {
        lock_or_recover(&self.inner.core).last_args.clone()
    }

    /// Observer key, if configured
    pub fn key(&self) -> Option<String> {
        lock_or_recover(&self.inner.core).options.key.clone()
    }
}

impl<A, F> ThrottlerInner<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    fn offer(this: &Arc<Self>, args: A) {
        let leading_args = {
            let mut core = lock_or_recover(&this.core);
            let enabled = core.options.enabled.resolve(&this.state.get());
            this.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                Self::clear_timer(&mut core, &this.scheduler);
                core.last_args = None;
                this.state.update(|s| s.is_pending = false);
                drop(core);
                this.publish();
                return;
            }

            let now = this.scheduler.now();
            let wait = core.options.wait.resolve(&this.state.get());
            let elapsed = this.state.with(|s| s.last_execution_time).map(|t| now - t);
            let window_open = elapsed.map_or(true, |e| e >= wait);

            if core.options.leading && window_open {
                Some(args)
            } else {
                // Inside the window: remember the latest args. An armed
                // timer is never re-armed, preserving window spacing.
                core.last_args = Some(args);
                if core.options.trailing {
                    this.state.update(|s| s.is_pending = true);
                    if core.timer.is_none() {
                        let delay = elapsed.map_or(Duration::ZERO, |e| wait.saturating_sub(e));
                        Self::arm_timer(this, &mut core, delay);
                    }
                }
                None
            }
        };

        if let Some(args) = leading_args {
            this.execute(args);
        }
        this.publish();
    }

    fn on_timer(&self, epoch: u64) {
        let trailing_args = {
            let mut core = lock_or_recover(&self.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
            let enabled = core.options.enabled.resolve(&self.state.get());
            let was_pending = self.state.with(|s| s.is_pending);
            self.state.update(|s| {
                s.is_enabled = enabled;
                s.is_pending = false;
            });
            if was_pending && enabled {
                core.last_args.take()
            } else {
                core.last_args = None;
                None
            }
        };

        if let Some(args) = trailing_args {
            self.execute(args);
        }
        self.publish();
    }

    fn execute(&self, args: A) {
        let now = self.scheduler.now();
        let wait = lock_or_recover(&self.core)
            .options
            .wait
            .resolve(&self.state.get());
        self.state.update(|s| {
            s.execution_count += 1;
            s.last_execution_time = Some(now);
            s.next_execution_time = Some(now + wait);
        });
        log_debug!(
            "throttler executed at {:?} ({} total)",
            now,
            self.state.with(|s| s.execution_count)
        );
        let op = lock_or_recover(&self.op).take();
        if let Some(mut f) = op {
            f(args);
            *lock_or_recover(&self.op) = Some(f);
        }
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut ThrottlerCore<A>, delay: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer(epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut ThrottlerCore<A>, scheduler: &Arc<dyn TimerScheduler>) {
        core.timer_epoch += 1;
        if let Some(id) = core.timer.take() {
            scheduler.cancel(id);
        }
    }

    fn publish(&self) {
        self.state.notify();
        let (on_change, observer, key) = {
            let core = lock_or_recover(&self.core);
            (
                core.options.on_state_change.clone(),
                core.options.observer.clone(),
                core.options.key.clone(),
            )
        };
        if let Some(f) = on_change {
            f(&self.state.get());
        }
        if let Some(observer) = observer {
            observer.state_changed(PrimitiveKind::Throttler, key.as_deref());
        }
    }
}

impl<A, F> Drop for ThrottlerInner<A, F> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = core.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (Arc<StdMutex<Vec<&'static str>>>, impl FnMut(&'static str) + Send) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v| sink.lock().unwrap().push(v))
    }

    #[test]
    fn test_window_spacing() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let t = Throttler::new(
            op,
            ThrottlerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_scheduler(clock.clone()),
        );

        t.maybe_execute("a");
        t.maybe_execute("b");
        clock.advance(Duration::from_millis(70));
        t.maybe_execute("c");
        t.maybe_execute("d");
        assert_eq!(seen.lock().unwrap().as_slice(), ["a"]);

        clock.advance(Duration::from_millis(30));
        assert_eq!(seen.lock().unwrap().as_slice(), ["a", "d"]);
        assert_eq!(t.execution_count(), 2);
    }

    #[test]
    fn test_trailing_timer_not_rearmed() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let t = Throttler::new(
            op,
            ThrottlerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_scheduler(clock.clone()),
        );

        t.maybe_execute("a");
        clock.advance(Duration::from_millis(50));
        t.maybe_execute("b");
        clock.advance(Duration::from_millis(40));
        // newer offer replaces the args without pushing the fire time out
        t.maybe_execute("c");
        clock.advance(Duration::from_millis(10));
        assert_eq!(seen.lock().unwrap().as_slice(), ["a", "c"]);
    }

    #[test]
    fn test_cancel_keeps_spacing() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let t = Throttler::new(
            op,
            ThrottlerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_scheduler(clock.clone()),
        );

        t.maybe_execute("a");
        clock.advance(Duration::from_millis(10));
        t.maybe_execute("b");
        t.cancel();
        assert!(!t.is_pending());

        clock.advance(Duration::from_millis(200));
        assert_eq!(seen.lock().unwrap().as_slice(), ["a"]);
        // spacing survives cancel
        assert_eq!(
            t.get_state().last_execution_time,
            Some(Duration::ZERO)
        );
    }
}
