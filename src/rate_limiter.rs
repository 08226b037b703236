//! Rate limiter: up to `limit` invocations per window
//!
//! Admission is purge-then-count: timestamps outside the current window are
//! dropped, then the offer is admitted iff fewer than `limit` remain. Fixed
//! windows start at the first admission of a bucket and reset wholesale once
//! `window` has elapsed since that entry; sliding windows count admissions in
//! `(now - window, now]`.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{RateLimiter, RateLimiterOptions, WindowType};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(
//!     |req: Request| send(req),
//!     RateLimiterOptions::default()
//!         .with_limit(30)
//!         .with_window(Duration::from_secs(60))
//!         .with_window_type(WindowType::Sliding)
//!         .with_on_reject(|state| eprintln!("rejected, {} so far", state.rejection_count)),
//! );
//!
//! if !limiter.maybe_execute(request) {
//!     // over quota; limiter.time_until_next_window() says how long to back off
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// How admitted timestamps are counted against the limit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WindowType {
    /// Bucket starts at the first admission and resets wholesale
    #[default]
    Fixed,
    /// Admissions are counted in `(now - window, now]`
    Sliding,
}

/// Execution status of a rate limiter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateLimiterStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// Capacity remains in the current window
    #[default]
    Idle,
    /// The current window is at its limit
    Exceeded,
}

/// Read-only rate limiter state snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterState {
    /// Scheduler times of the admissions in the current window
    pub execution_times: Vec<Duration>,
    /// Number of admitted invocations
    pub execution_count: usize,
    /// Number of rejected offers
    pub rejection_count: usize,
    /// Number of offers (admitted or not)
    pub maybe_execute_count: usize,
    /// Whether the current window is at its limit
    pub is_exceeded: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Derived status
    pub status: RateLimiterStatus,
}

impl DerivedState for RateLimiterState {
    fn recompute(&mut self) {
        self.status = if !self.is_enabled {
            RateLimiterStatus::Disabled
        } else if self.is_exceeded {
            RateLimiterStatus::Exceeded
        } else {
            RateLimiterStatus::Idle
        };
    }
}

fn default_state() -> RateLimiterState {
    RateLimiterState {
        is_enabled: true,
        ..RateLimiterState::default()
    }
}

/// Rate limiter configuration
#[derive(Clone)]
pub struct RateLimiterOptions {
    /// Admissions allowed per window
    pub limit: Setting<usize, RateLimiterState>,
    /// Window width
    pub window: Setting<Duration, RateLimiterState>,
    /// Fixed or sliding counting
    pub window_type: WindowType,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, RateLimiterState>,
    /// Called with the fresh snapshot after each rejection
    pub on_reject: Option<Arc<dyn Fn(&RateLimiterState) + Send + Sync>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&RateLimiterState) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<RateLimiterState>,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            limit: 10.into(),
            window: Duration::from_secs(1).into(),
            window_type: WindowType::Fixed,
            enabled: true.into(),
            on_reject: None,
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
            initial_state: None,
        }
    }
}

impl RateLimiterOptions {
    /// Set the admission limit
    pub fn with_limit(mut self, limit: impl Into<Setting<usize, RateLimiterState>>) -> Self {
        self.limit = limit.into();
        self
    }

    /// Set the window width
    pub fn with_window(mut self, window: impl Into<Setting<Duration, RateLimiterState>>) -> Self {
        self.window = window.into();
        self
    }

    /// Choose fixed or sliding counting
    pub fn with_window_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, RateLimiterState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Register a rejection callback
    pub fn with_on_reject(mut self, f: impl Fn(&RateLimiterState) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
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
        f: impl Fn(&RateLimiterState) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: RateLimiterState) -> Self {
        self.initial_state = Some(state);
        self
    }
}

struct RateLimiterCore {
    options: RateLimiterOptions,
    /// Expiration timers keyed by an admission sequence number
    expiration_timers: HashMap<u64, TimerId>,
    expire_seq: u64,
}

struct RateLimiterInner<A, F> {
    op: Mutex<Option<F>>,
    core: Mutex<RateLimiterCore>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<RateLimiterState>,
    _args: std::marker::PhantomData<fn(A)>,
}

/// Permits up to `limit` invocations per window; rejects the rest.
///
/// Cheap to clone; clones share the same state.
pub struct RateLimiter<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    inner: Arc<RateLimiterInner<A, F>>,
}

impl<A, F> Clone for RateLimiter<A, F>
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

/// Drop timestamps that no longer count against the limit
pub(crate) fn purge(
    times: &mut Vec<Duration>,
    now: Duration,
    window: Duration,
    window_type: WindowType,
) {
    match window_type {
        WindowType::Fixed => {
            if times.first().map_or(false, |&first| now >= first + window) {
                times.clear();
            }
        }
        WindowType::Sliding => {
            times.retain(|&t| t + window > now);
        }
    }
}

/// Count of timestamps that would survive a purge, without mutating
pub(crate) fn live_count(
    times: &[Duration],
    now: Duration,
    window: Duration,
    window_type: WindowType,
) -> usize {
    match window_type {
        WindowType::Fixed => {
            if times.first().map_or(false, |&first| now >= first + window) {
                0
            } else {
                times.len()
            }
        }
        WindowType::Sliding => times.iter().filter(|&&t| t + window > now).count(),
    }
}

impl<A, F> RateLimiter<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    /// Create a rate limiter around `op`
    pub fn new(op: F, options: RateLimiterOptions) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let initial = options.initial_state.clone().unwrap_or_else(default_state);
        Self {
            inner: Arc::new(RateLimiterInner {
                op: Mutex::new(Some(op)),
                core: Mutex::new(RateLimiterCore {
                    options,
                    expiration_timers: HashMap::new(),
                    expire_seq: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
                _args: std::marker::PhantomData,
            }),
        }
    }

    /// Offer arguments; returns whether the call was admitted and executed
    pub fn maybe_execute(&self, args: A) -> bool {
        RateLimiterInner::offer(&self.inner, args)
    }

    /// Admissions left in the current window
    pub fn remaining_in_window(&self) -> usize {
        let now = self.inner.scheduler.now();
        let core = lock_or_recover(&self.inner.core);
        let snapshot = self.inner.state.get();
        let limit = core.options.limit.resolve(&snapshot);
        let window = core.options.window.resolve(&snapshot);
        let live = live_count(&snapshot.execution_times, now, window, core.options.window_type);
        limit.saturating_sub(live)
    }

    /// Time until the window frees capacity; zero when capacity remains
    pub fn time_until_next_window(&self) -> Duration {
        let now = self.inner.scheduler.now();
        let core = lock_or_recover(&self.inner.core);
        let snapshot = self.inner.state.get();
        let limit = core.options.limit.resolve(&snapshot);
        let window = core.options.window.resolve(&snapshot);
        let window_type = core.options.window_type;
        if live_count(&snapshot.execution_times, now, window, window_type) < limit {
            return Duration::ZERO;
        }
        snapshot
            .execution_times
            .iter()
            .copied()
            .find(|&t| t + window > now)
            .map_or(Duration::ZERO, |oldest| (oldest + window).saturating_sub(now))
    }

    /// Clear timestamps and counters; cancel every expiration timer
    pub fn reset(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            for (_, id) in core.expiration_timers.drain() {
                self.inner.scheduler.cancel(id);
            }
        }
        self.inner.state.replace(default_state());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut RateLimiterOptions)) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> RateLimiterState {
        self.inner.state.get()
    }

    /// Register a change callback
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe(f)
    }

    /// Number of admitted invocations
    pub fn execution_count(&self) -> usize {
        self.inner.state.with(|s| s.execution_count)
    }

    /// Number of rejected offers
    pub fn rejection_count(&self) -> usize {
        self.inner.state.with(|s| s.rejection_count)
    }

    /// Whether the current window is at its limit
    pub fn is_exceeded(&self) -> bool {
        self.inner.state.with(|s| s.is_exceeded)
    }

    /// Observer key, if configured
    pub fn key(&self) -> Option<String> {
        lock_or_recover(&self.inner.core).options.key.clone()
    }
}

impl<A, F> RateLimiterInner<A, F>
where
    A: Clone + Send + 'static,
    F: FnMut(A) + Send + 'static,
{
    fn offer(this: &Arc<Self>, args: A) -> bool {
        enum Outcome<A> {
            Execute(A),
            Reject,
            Disabled,
        }

        let outcome = {
            let mut core = lock_or_recover(&this.core);
            let enabled = core.options.enabled.resolve(&this.state.get());
            this.state.update(|s| {
                s.is_enabled = enabled;
                s.maybe_execute_count += 1;
            });
            if !enabled {
                Outcome::Disabled
            } else {
                let now = this.scheduler.now();
                let snapshot = this.state.get();
                let limit = core.options.limit.resolve(&snapshot);
                let window = core.options.window.resolve(&snapshot);
                let window_type = core.options.window_type;

                let mut admitted = false;
                this.state.update(|s| {
                    purge(&mut s.execution_times, now, window, window_type);
                    if s.execution_times.len() < limit {
                        s.execution_times.push(now);
                        s.execution_count += 1;
                        admitted = true;
                    } else {
                        s.rejection_count += 1;
                    }
                    s.is_exceeded = s.execution_times.len() >= limit;
                });

                if admitted {
                    let arm_bucket_timer = window_type == WindowType::Fixed
                        && this.state.with(|s| s.execution_times.len()) == 1;
                    if window_type == WindowType::Sliding || arm_bucket_timer {
                        Self::arm_expiration(this, &mut core, window);
                    }
                    Outcome::Execute(args)
                } else {
                    log_debug!(
                        "rate limiter rejected offer ({} rejections)",
                        this.state.with(|s| s.rejection_count)
                    );
                    Outcome::Reject
                }
            }
        };

        match outcome {
            Outcome::Execute(args) => {
                let op = lock_or_recover(&this.op).take();
                if let Some(mut f) = op {
                    f(args);
                    *lock_or_recover(&this.op) = Some(f);
                }
                this.publish();
                true
            }
            Outcome::Reject => {
                let on_reject = lock_or_recover(&this.core).options.on_reject.clone();
                if let Some(f) = on_reject {
                    f(&this.state.get());
                }
                this.publish();
                false
            }
            Outcome::Disabled => {
                this.publish();
                false
            }
        }
    }

    /// One timer per admitted timestamp (sliding) or per bucket (fixed)
    /// keeps `is_exceeded` eventually consistent without polling.
    fn arm_expiration(self_arc: &Arc<Self>, core: &mut RateLimiterCore, window: Duration) {
        core.expire_seq += 1;
        let seq = core.expire_seq;
        let weak = Arc::downgrade(self_arc);
        let id = self_arc.scheduler.schedule(
            window,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_expiration(seq);
                }
            }),
        );
        core.expiration_timers.insert(seq, id);
    }

    fn on_expiration(&self, seq: u64) {
        {
            let mut core = lock_or_recover(&self.core);
            core.expiration_timers.remove(&seq);
            let now = self.scheduler.now();
            let snapshot = self.state.get();
            let limit = core.options.limit.resolve(&snapshot);
            let window = core.options.window.resolve(&snapshot);
            let window_type = core.options.window_type;
            self.state.update(|s| {
                purge(&mut s.execution_times, now, window, window_type);
                s.is_exceeded = s.execution_times.len() >= limit;
            });
        }
        self.publish();
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
            observer.state_changed(PrimitiveKind::RateLimiter, key.as_deref());
        }
    }
}

impl<A, F> Drop for RateLimiterInner<A, F> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, id) in core.expiration_timers.iter() {
            self.scheduler.cancel(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use std::sync::Mutex as StdMutex;

    fn limiter(
        clock: &Arc<VirtualScheduler>,
        limit: usize,
        window: u64,
        window_type: WindowType,
    ) -> (Arc<StdMutex<Vec<u32>>>, RateLimiter<u32, impl FnMut(u32) + Send>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let limiter = RateLimiter::new(
            move |v: u32| sink.lock().unwrap().push(v),
            RateLimiterOptions::default()
                .with_limit(limit)
                .with_window(Duration::from_millis(window))
                .with_window_type(window_type)
                .with_scheduler(clock.clone() as Arc<dyn crate::scheduler::TimerScheduler>),
        );
        (seen, limiter)
    }

    #[test]
    fn test_fixed_window_admits_then_rejects() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, l) = limiter(&clock, 3, 1000, WindowType::Fixed);

        assert!(l.maybe_execute(1));
        assert!(l.maybe_execute(2));
        assert!(l.maybe_execute(3));
        assert!(!l.maybe_execute(4));
        assert!(l.is_exceeded());
        assert_eq!(seen.lock().unwrap().as_slice(), [1, 2, 3]);
        assert_eq!(l.rejection_count(), 1);

        clock.advance(Duration::from_millis(1001));
        assert!(!l.is_exceeded());
        assert!(l.maybe_execute(5));
        assert_eq!(seen.lock().unwrap().as_slice(), [1, 2, 3, 5]);
    }

    #[test]
    fn test_sliding_window_ages_out_oldest() {
        let clock = Arc::new(VirtualScheduler::new());
        let (_, l) = limiter(&clock, 3, 1000, WindowType::Sliding);

        assert!(l.maybe_execute(1)); // t=0
        clock.advance(Duration::from_millis(400));
        assert!(l.maybe_execute(2)); // t=400
        clock.advance(Duration::from_millis(300));
        assert!(l.maybe_execute(3)); // t=700
        clock.advance(Duration::from_millis(200));
        assert!(!l.maybe_execute(4)); // t=900, window full

        clock.advance(Duration::from_millis(101));
        assert!(l.maybe_execute(5)); // t=1001, t=0 aged out
    }

    #[test]
    fn test_zero_limit_never_admits() {
        let clock = Arc::new(VirtualScheduler::new());
        let (seen, l) = limiter(&clock, 0, 1000, WindowType::Fixed);

        assert!(!l.maybe_execute(1));
        clock.advance(Duration::from_millis(5000));
        assert!(!l.maybe_execute(2));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(l.rejection_count(), 2);
    }

    #[test]
    fn test_remaining_and_retry_in() {
        let clock = Arc::new(VirtualScheduler::new());
        let (_, l) = limiter(&clock, 2, 1000, WindowType::Sliding);

        assert_eq!(l.remaining_in_window(), 2);
        assert_eq!(l.time_until_next_window(), Duration::ZERO);

        l.maybe_execute(1);
        clock.advance(Duration::from_millis(250));
        l.maybe_execute(2);
        assert_eq!(l.remaining_in_window(), 0);
        assert_eq!(l.time_until_next_window(), Duration::from_millis(750));
    }

    #[test]
    fn test_expiration_timer_clears_exceeded() {
        let clock = Arc::new(VirtualScheduler::new());
        let (_, l) = limiter(&clock, 1, 1000, WindowType::Sliding);

        l.maybe_execute(1);
        l.maybe_execute(2);
        assert!(l.is_exceeded());

        // no offer needed: the expiration timer purges on its own
        clock.advance(Duration::from_millis(1001));
        assert!(!l.is_exceeded());
        assert!(l.get_state().execution_times.is_empty());
    }
}
