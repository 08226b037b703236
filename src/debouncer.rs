//! Debouncer: collapse bursts into a single delayed invocation
//!
//! A debouncer wraps a user operation and delays it until a quiet period of
//! `wait` has elapsed since the last offer. With `leading` enabled the first
//! offer of a burst fires immediately; with `trailing` (the default) the
//! last-offered arguments fire once the burst goes quiet.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{Debouncer, DebouncerOptions};
//! use std::time::Duration;
//!
//! let search = Debouncer::new(
//!     |query: String| perform_search(&query),
//!     DebouncerOptions::default().with_wait(Duration::from_millis(300)),
//! );
//!
//! // Bursty keystrokes collapse into one search 300ms after the last one.
//! search.maybe_execute("pa".to_string());
//! search.maybe_execute("pace".to_string());
//! search.maybe_execute("pacer".to_string());
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Execution status of a debouncer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DebouncerStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// No trailing invocation is scheduled
    #[default]
    Idle,
    /// A trailing invocation is waiting on the timer
    Pending,
}

/// Read-only debouncer state snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebouncerState {
    /// Whether the next offer may fire on the leading edge
    pub can_leading_execute: bool,
    /// Whether a trailing invocation is scheduled
    pub is_pending: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Number of completed invocations
    pub execution_count: usize,
    /// Derived status
    pub status: DebouncerStatus,
}

impl Default for DebouncerState {
    fn default() -> Self {
        Self {
            can_leading_execute: true,
            is_pending: false,
            is_enabled: true,
            execution_count: 0,
            status: DebouncerStatus::Idle,
        }
    }
}

impl DerivedState for DebouncerState {
    fn recompute(&mut self) {
        self.status = if !self.is_enabled {
            DebouncerStatus::Disabled
        } else if self.is_pending {
            DebouncerStatus::Pending
        } else {
            DebouncerStatus::Idle
        };
    }
}

/// Debouncer configuration
#[derive(Clone)]
pub struct DebouncerOptions {
    /// Quiet period before the trailing edge fires
    pub wait: Setting<Duration, DebouncerState>,
    /// Fire immediately on the first offer of a burst
    pub leading: bool,
    /// Fire with the latest args once the burst goes quiet
    pub trailing: bool,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, DebouncerState>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&DebouncerState) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<DebouncerState>,
}

impl Default for DebouncerOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(300).into(),
            leading: false,
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

impl DebouncerOptions {
    /// Set the quiet period
    pub fn with_wait(mut self, wait: impl Into<Setting<Duration, DebouncerState>>) -> Self {
        self.wait = wait.into();
        self
    }

    /// Fire on the leading edge of each burst
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Fire on the trailing edge of each burst
    pub fn with_trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, DebouncerState>>) -> Self {
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
        f: impl Fn(&DebouncerState) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: DebouncerState) -> Self {
        self.initial_state = Some(state);
        self
    }
}

struct DebouncerCore<A> {
    options: DebouncerOptions,
    last_args: Option<A>,
    timer: Option<TimerId>,
    /// Bumped on every arm/cancel; stale timer callbacks check it and bail
    timer_epoch: u64,
}

struct DebouncerInner<A, F> {
    op: Mutex<Option<F>>,
    core: Mutex<DebouncerCore<A>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<DebouncerState>,
}

/// Collapses bursts of offers into a single delayed invocation.
///
/// Cheap to clone; clones share the same state.
pub struct Debouncer<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    inner: Arc<DebouncerInner<A, F>>,
}

impl<A, F> Clone for Debouncer<A, F>
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

impl<A, F> Debouncer<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    /// Create a debouncer around `op`
    pub fn new(op: F, options: DebouncerOptions) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(DebouncerInner {
                op: Mutex::new(Some(op)),
                core: Mutex::new(DebouncerCore {
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

    /// Offer arguments; the policy decides whether and when they run
    pub fn maybe_execute(&self, args: A) {
        DebouncerInner::offer(&self.inner, args);
    }

    /// Execute a pending trailing invocation immediately
    pub fn flush(&self) {
        let args = {
            let mut core = lock_or_recover(&self.inner.core);
            if self.inner.state.with(|s| s.is_pending) {
                DebouncerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
                self.inner.state.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                });
                core.last_args.take()
            } else {
                None
            }
        };
        if let Some(args) = args {
            self.inner.invoke(args);
        }
        self.inner.publish();
    }

    /// Abandon any pending invocation and reset the leading-edge latch
    pub fn cancel(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            DebouncerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
        }
        self.inner.state.update(|s| {
            s.is_pending = false;
            s.can_leading_execute = true;
        });
        self.inner.publish();
    }

    /// Cancel and restore the default state (counters included)
    pub fn reset(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            DebouncerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
        }
        self.inner.state.replace(DebouncerState::default());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut DebouncerOptions)) {
        let disabled = {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                DebouncerInner::<A, F>::clear_timer(&mut core, &self.inner.scheduler);
                core.last_args = None;
            }
            !enabled
        };
        if disabled {
            self.inner.state.update(|s| {
                s.is_pending = false;
                s.can_leading_execute = true;
            });
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> DebouncerState {
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

impl<A, F> DebouncerInner<A, F>
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
                this.state.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                });
                drop(core);
                this.publish();
                return;
            }

            core.last_args = Some(args.clone());
            let mut did_leading = false;
            if core.options.leading && this.state.with(|s| s.can_leading_execute) {
                this.state.update(|s| s.can_leading_execute = false);
                did_leading = true;
            }
            if core.options.trailing && !did_leading {
                this.state.update(|s| s.is_pending = true);
            }
            did_leading.then(|| args)
        };

        if let Some(args) = leading_args {
            this.invoke(args);
        }

        // Every offer resets the wait timer; the trailing edge tracks the
        // last offer of the burst.
        {
            let mut core = lock_or_recover(&this.core);
            let wait = core.options.wait.resolve(&this.state.get());
            Self::clear_timer(&mut core, &this.scheduler);
            Self::arm_timer(this, &mut core, wait);
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
                s.can_leading_execute = true;
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
            self.invoke(args);
        }
        self.publish();
    }

    fn invoke(&self, args: A) {
        self.state.update(|s| s.execution_count += 1);
        log_debug!(
            "debouncer executed ({} total)",
            self.state.with(|s| s.execution_count)
        );
        // The operation runs with no internal lock held; it is taken out of
        // its slot so a reentrant flush cannot deadlock.
        let op = lock_or_recover(&self.op).take();
        if let Some(mut f) = op {
            f(args);
            *lock_or_recover(&self.op) = Some(f);
        }
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut DebouncerCore<A>, wait: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer(epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut DebouncerCore<A>, scheduler: &Arc<dyn TimerScheduler>) {
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
            observer.state_changed(PrimitiveKind::Debouncer, key.as_deref());
        }
    }
}

impl<A, F> Drop for DebouncerInner<A, F> {
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

    fn collector() -> (Arc<StdMutex<Vec<u32>>>, impl FnMut(u32) + Send + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: u32| sink.lock().unwrap().push(v))
    }

    #[test]
    fn test_trailing_uses_last_args() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let d = Debouncer::new(
            op,
            DebouncerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_scheduler(clock.clone()),
        );

        d.maybe_execute(1);
        d.maybe_execute(2);
        d.maybe_execute(3);
        assert!(d.is_pending());

        clock.advance(Duration::from_millis(100));
        assert_eq!(seen.lock().unwrap().as_slice(), [3]);
        assert!(!d.is_pending());
        assert_eq!(d.execution_count(), 1);
    }

    #[test]
    fn test_leading_only_burst_fires_once() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let d = Debouncer::new(
            op,
            DebouncerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_leading(true)
                .with_trailing(true)
                .with_scheduler(clock.clone()),
        );

        d.maybe_execute(7);
        assert_eq!(seen.lock().unwrap().as_slice(), [7]);
        assert!(!d.is_pending());

        clock.advance(Duration::from_millis(200));
        // a single-offer burst must not re-fire on the trailing edge
        assert_eq!(seen.lock().unwrap().as_slice(), [7]);
        assert_eq!(d.execution_count(), 1);
    }

    #[test]
    fn test_disable_mid_wait_abandons_pending() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, op) = collector();
        let d = Debouncer::new(
            op,
            DebouncerOptions::default()
                .with_wait(Duration::from_millis(100))
                .with_scheduler(clock.clone()),
        );

        d.maybe_execute(1);
        d.set_options(|o| o.enabled = false.into());
        assert!(!d.is_pending());
        assert_eq!(d.get_state().status, DebouncerStatus::Disabled);

        clock.advance(Duration::from_millis(200));
        assert!(seen.lock().unwrap().is_empty());

        // re-enabling does not auto-fire
        d.set_options(|o| o.enabled = true.into());
        clock.advance(Duration::from_millis(200));
        assert!(seen.lock().unwrap().is_empty());
    }
}
