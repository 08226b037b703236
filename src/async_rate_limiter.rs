//! Async rate limiter: windowed admission with retries per call
//!
//! Admission follows the same purge-then-count policy as
//! [`RateLimiter`](crate::RateLimiter). Every admitted call runs through its
//! own [`AsyncRetryer`], so concurrent admitted executions stay independent:
//! each gets its own attempt budget and cancellation token, keyed by a call
//! sequence number.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncRateLimiter, AsyncRateLimiterOptions, RetryOptions, WindowType};
//! use std::time::Duration;
//!
//! let api = AsyncRateLimiter::new(
//!     |req: Request, _token| async move { call_api(req).await },
//!     AsyncRateLimiterOptions::default()
//!         .with_limit(10)
//!         .with_window(Duration::from_secs(1))
//!         .with_retry(RetryOptions::default().with_max_attempts(3)),
//! );
//!
//! match api.maybe_execute(request).await? {
//!     Some(response) => handle(response),
//!     None => back_off(api.time_until_next_window()),
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::PacerError;
use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::rate_limiter::{live_count, purge, WindowType};
use crate::retry::{AsyncRetryer, RetryOptions};
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Execution status of an async rate limiter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncRateLimiterStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// Capacity remains in the current window
    #[default]
    Idle,
    /// At least one admitted call is in flight
    Executing,
    /// The current window is at its limit
    Exceeded,
}

/// Read-only async rate limiter state snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsyncRateLimiterState {
    /// Scheduler times of the admissions in the current window
    pub execution_times: Vec<Duration>,
    /// Number of admitted invocations
    pub execution_count: usize,
    /// Number of rejected offers
    pub rejection_count: usize,
    /// Number of offers (admitted or not)
    pub maybe_execute_count: usize,
    /// Executions that resolved successfully
    pub success_count: usize,
    /// Executions that failed after exhausting their retries
    pub error_count: usize,
    /// Executions that settled either way
    pub settle_count: usize,
    /// Admitted calls currently in flight
    pub active_executions: usize,
    /// Whether any admitted call is in flight
    pub is_executing: bool,
    /// Whether the current window is at its limit
    pub is_exceeded: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Derived status
    pub status: AsyncRateLimiterStatus,
}

impl DerivedState for AsyncRateLimiterState {
    fn recompute(&mut self) {
        self.is_executing = self.active_executions > 0;
        self.status = if !self.is_enabled {
            AsyncRateLimiterStatus::Disabled
        } else if self.is_exceeded {
            AsyncRateLimiterStatus::Exceeded
        } else if self.is_executing {
            AsyncRateLimiterStatus::Executing
        } else {
            AsyncRateLimiterStatus::Idle
        };
    }
}

fn default_state() -> AsyncRateLimiterState {
    AsyncRateLimiterState {
        is_enabled: true,
        ..AsyncRateLimiterState::default()
    }
}

/// Async rate limiter configuration
#[derive(Clone)]
pub struct AsyncRateLimiterOptions {
    /// Admissions allowed per window
    pub limit: Setting<usize, AsyncRateLimiterState>,
    /// Window width
    pub window: Setting<Duration, AsyncRateLimiterState>,
    /// Fixed or sliding counting
    pub window_type: WindowType,
    /// Per-call retry policy (default: one attempt, no retries)
    pub retry: RetryOptions,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, AsyncRateLimiterState>,
    /// Called with the fresh snapshot after each rejection
    pub on_reject: Option<Arc<dyn Fn(&AsyncRateLimiterState) + Send + Sync>>,
    /// Called with each execution error
    pub on_error: Option<Arc<dyn Fn(&PacerError) + Send + Sync>>,
    /// Called after each execution settles either way
    pub on_settled: Option<Arc<dyn Fn(&AsyncRateLimiterState) + Send + Sync>>,
    /// Whether callers see `Err` on operation failure.
    /// Defaults to true without an `on_error` handler, false with one.
    pub throw_on_error: Option<bool>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&AsyncRateLimiterState) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<AsyncRateLimiterState>,
}

impl Default for AsyncRateLimiterOptions {
    fn default() -> Self {
        Self {
            limit: 10.into(),
            window: Duration::from_secs(1).into(),
            window_type: WindowType::Fixed,
            retry: RetryOptions::single_attempt(),
            enabled: true.into(),
            on_reject: None,
            on_error: None,
            on_settled: None,
            throw_on_error: None,
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
            initial_state: None,
        }
    }
}

impl AsyncRateLimiterOptions {
    /// Set the admission limit
    pub fn with_limit(
        mut self,
        limit: impl Into<Setting<usize, AsyncRateLimiterState>>,
    ) -> Self {
        self.limit = limit.into();
        self
    }

    /// Set the window width
    pub fn with_window(
        mut self,
        window: impl Into<Setting<Duration, AsyncRateLimiterState>>,
    ) -> Self {
        self.window = window.into();
        self
    }

    /// Choose fixed or sliding counting
    pub fn with_window_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    /// Set the per-call retry policy
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(
        mut self,
        enabled: impl Into<Setting<bool, AsyncRateLimiterState>>,
    ) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Register a rejection callback
    pub fn with_on_reject(
        mut self,
        f: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static,
    ) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }

    /// Called with each execution error
    pub fn with_on_error(mut self, f: impl Fn(&PacerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after each execution settles
    pub fn with_on_settled(
        mut self,
        f: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Force or suppress `Err` results for callers
    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = Some(throw_on_error);
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
        f: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: AsyncRateLimiterState) -> Self {
        self.initial_state = Some(state);
        self
    }

    fn throws(&self) -> bool {
        self.throw_on_error.unwrap_or(self.on_error.is_none())
    }
}

type AsyncOp<A, R> =
    Arc<dyn Fn(A, CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

struct AsyncRateLimiterCore {
    options: AsyncRateLimiterOptions,
    expiration_timers: HashMap<u64, TimerId>,
    expire_seq: u64,
    /// In-flight retryers keyed by call sequence number
    retryers: HashMap<u64, AsyncRetryer>,
    call_seq: u64,
}

struct AsyncRateLimiterInner<A, R> {
    op: AsyncOp<A, R>,
    core: Mutex<AsyncRateLimiterCore>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<AsyncRateLimiterState>,
}

/// Rate limiter over an async operation, with bounded retries per admitted
/// call.
///
/// Cheap to clone; clones share the same state.
pub struct AsyncRateLimiter<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncRateLimiterInner<A, R>>,
}

impl<A, R> Clone for AsyncRateLimiter<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Admission {
    Execute(u64, AsyncRetryer),
    Reject,
    Disabled,
}

impl<A, R> AsyncRateLimiter<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create an async rate limiter around `op`
    pub fn new<Op, Fut>(op: Op, options: AsyncRateLimiterOptions) -> Self
    where
        Op: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let initial = options.initial_state.clone().unwrap_or_else(default_state);
        Self {
            inner: Arc::new(AsyncRateLimiterInner {
                op: Arc::new(move |args, token| Box::pin(op(args, token))),
                core: Mutex::new(AsyncRateLimiterCore {
                    options,
                    expiration_timers: HashMap::new(),
                    expire_seq: 0,
                    retryers: HashMap::new(),
                    call_seq: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Offer arguments. Admitted calls run (with retries) and resolve with
    /// `Ok(Some(result))`; rejected calls resolve with `Ok(None)` and fire
    /// `on_reject`. Failures surface as `Err` per `throw_on_error`.
    pub async fn maybe_execute(&self, args: A) -> Result<Option<R>, PacerError> {
        // admission is decided synchronously; no lock crosses an await
        let admission = AsyncRateLimiterInner::admit(&self.inner);
        match admission {
            Admission::Disabled => {
                self.inner.publish();
                Ok(None)
            }
            Admission::Reject => {
                let on_reject = lock_or_recover(&self.inner.core).options.on_reject.clone();
                if let Some(f) = on_reject {
                    f(&self.inner.state.get());
                }
                self.inner.publish();
                Ok(None)
            }
            Admission::Execute(seq, retryer) => {
                self.inner.state.update(|s| s.active_executions += 1);
                self.inner.publish();

                let op = self.inner.op.clone();
                let call_args = args.clone();
                let result = retryer
                    .execute(move |token| op(call_args.clone(), token))
                    .await;

                {
                    let mut core = lock_or_recover(&self.inner.core);
                    core.retryers.remove(&seq);
                }
                self.inner.state.update(|s| s.active_executions -= 1);
                self.inner.settle(result)
            }
        }
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

    /// Signal every in-flight call to cancel
    pub fn abort(&self) {
        let retryers: Vec<AsyncRetryer> = {
            let core = lock_or_recover(&self.inner.core);
            core.retryers.values().cloned().collect()
        };
        for retryer in retryers {
            retryer.abort();
        }
    }

    /// Abort in-flight calls, clear timestamps and counters, cancel every
    /// expiration timer
    pub fn reset(&self) {
        self.abort();
        {
            let mut core = lock_or_recover(&self.inner.core);
            for (_, id) in core.expiration_timers.drain() {
                self.inner.scheduler.cancel(id);
            }
            core.retryers.clear();
        }
        self.inner.state.replace(default_state());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut AsyncRateLimiterOptions)) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> AsyncRateLimiterState {
        self.inner.state.get()
    }

    /// Register a change callback
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe(f)
    }

    /// Whether the current window is at its limit
    pub fn is_exceeded(&self) -> bool {
        self.inner.state.with(|s| s.is_exceeded)
    }

    /// Whether any admitted call is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.with(|s| s.is_executing)
    }

    /// Observer key, if configured
    pub fn key(&self) -> Option<String> {
        lock_or_recover(&self.inner.core).options.key.clone()
    }
}

impl<A, R> AsyncRateLimiterInner<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn admit(this: &Arc<Self>) -> Admission {
        let mut core = lock_or_recover(&this.core);
        let enabled = core.options.enabled.resolve(&this.state.get());
        this.state.update(|s| {
            s.is_enabled = enabled;
            s.maybe_execute_count += 1;
        });
        if !enabled {
            return Admission::Disabled;
        }

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

        if !admitted {
            log_debug!(
                "async rate limiter rejected offer ({} rejections)",
                this.state.with(|s| s.rejection_count)
            );
            return Admission::Reject;
        }

        let arm_bucket_timer =
            window_type == WindowType::Fixed && this.state.with(|s| s.execution_times.len()) == 1;
        if window_type == WindowType::Sliding || arm_bucket_timer {
            Self::arm_expiration(this, &mut core, window);
        }

        core.call_seq += 1;
        let seq = core.call_seq;
        let mut retry = core.options.retry.clone();
        if retry.scheduler.is_none() {
            retry.scheduler = Some(this.scheduler.clone());
        }
        let retryer = AsyncRetryer::new(retry);
        core.retryers.insert(seq, retryer.clone());
        Admission::Execute(seq, retryer)
    }

    /// Map a settled retryer result onto counters, callbacks, and the
    /// caller-facing result
    fn settle(&self, result: Result<R, PacerError>) -> Result<Option<R>, PacerError> {
        let (on_error, on_settled, throws) = {
            let core = lock_or_recover(&self.core);
            (
                core.options.on_error.clone(),
                core.options.on_settled.clone(),
                core.options.throws(),
            )
        };

        let outcome = match result {
            Ok(value) => {
                self.state.update(|s| {
                    s.success_count += 1;
                    s.settle_count += 1;
                });
                Ok(Some(value))
            }
            Err(PacerError::Aborted) => {
                self.state.update(|s| s.settle_count += 1);
                Ok(None)
            }
            Err(error) => {
                self.state.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                });
                if let Some(f) = on_error {
                    f(&error);
                }
                if throws {
                    Err(error)
                } else {
                    Ok(None)
                }
            }
        };

        if let Some(f) = on_settled {
            f(&self.state.get());
        }
        self.publish();
        outcome
    }

    fn arm_expiration(self_arc: &Arc<Self>, core: &mut AsyncRateLimiterCore, window: Duration) {
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
            observer.state_changed(PrimitiveKind::AsyncRateLimiter, key.as_deref());
        }
    }
}

impl<A, R> Drop for AsyncRateLimiterInner<A, R> {
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit() {
        let limiter: AsyncRateLimiter<u32, u32> = AsyncRateLimiter::new(
            |v: u32, _token| async move { Ok(v) },
            AsyncRateLimiterOptions::default()
                .with_limit(2)
                .with_window(Duration::from_secs(1)),
        );

        assert_eq!(limiter.maybe_execute(1).await.unwrap(), Some(1));
        assert_eq!(limiter.maybe_execute(2).await.unwrap(), Some(2));
        assert_eq!(limiter.maybe_execute(3).await.unwrap(), None);
        assert_eq!(limiter.get_state().rejection_count, 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(limiter.maybe_execute(4).await.unwrap(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_per_admitted_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let limiter: AsyncRateLimiter<u32, u32> = AsyncRateLimiter::new(
            move |v: u32, _token| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("transient")
                    }
                    Ok(v)
                }
            },
            AsyncRateLimiterOptions::default()
                .with_limit(5)
                .with_window(Duration::from_secs(1))
                .with_retry(
                    RetryOptions::default()
                        .with_max_attempts(3)
                        .with_initial_delay(Duration::from_millis(10)),
                ),
        );

        assert_eq!(limiter.maybe_execute(7).await.unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // retries consumed one admission, not two
        assert_eq!(limiter.get_state().execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_fires_on_reject_and_never_errors() {
        let rejections = Arc::new(AtomicUsize::new(0));
        let rejections_clone = rejections.clone();
        let limiter: AsyncRateLimiter<u32, u32> = AsyncRateLimiter::new(
            |v: u32, _token| async move { Ok(v) },
            AsyncRateLimiterOptions::default()
                .with_limit(1)
                .with_window(Duration::from_secs(1))
                .with_on_reject(move |_state| {
                    rejections_clone.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert!(limiter.maybe_execute(1).await.unwrap().is_some());
        assert!(limiter.maybe_execute(2).await.unwrap().is_none());
        assert_eq!(rejections.load(Ordering::SeqCst), 1);
    }
}
