//! Async debouncer: debounced invocation with an awaitable result
//!
//! Same edge policies as [`Debouncer`](crate::Debouncer), but the wrapped
//! operation is async and every `maybe_execute` returns a future. Callers
//! awaiting offers that were superseded within the burst resolve with the
//! most recent completed invocation's result; the caller whose offer
//! actually fires resolves with that execution's result.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncDebouncer, AsyncDebouncerOptions};
//! use std::time::Duration;
//!
//! let search = AsyncDebouncer::new(
//!     |query: String, _token| async move { fetch_results(&query).await },
//!     AsyncDebouncerOptions::default().with_wait(Duration::from_millis(300)),
//! );
//!
//! // resolves with the results for "pacer" (the last offer of the burst)
//! let results = search.maybe_execute("pacer".to_string()).await?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::PacerError;
use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Execution status of an async debouncer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncDebouncerStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// Nothing pending
    #[default]
    Idle,
    /// A trailing invocation is waiting on the timer
    Pending,
    /// The operation is in flight
    Executing,
}

/// Read-only async debouncer state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AsyncDebouncerState<R> {
    /// Whether the next offer may fire on the leading edge
    pub can_leading_execute: bool,
    /// Whether a trailing invocation is scheduled
    pub is_pending: bool,
    /// Whether the operation is in flight
    pub is_executing: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Executions that resolved successfully
    pub success_count: usize,
    /// Executions that failed
    pub error_count: usize,
    /// Executions that settled either way
    pub settle_count: usize,
    /// Result of the most recent successful execution
    pub last_result: Option<R>,
    /// Derived status
    pub status: AsyncDebouncerStatus,
}

impl<R> Default for AsyncDebouncerState<R> {
    fn default() -> Self {
        Self {
            can_leading_execute: true,
            is_pending: false,
            is_executing: false,
            is_enabled: true,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            last_result: None,
            status: AsyncDebouncerStatus::Idle,
        }
    }
}

impl<R: Clone> DerivedState for AsyncDebouncerState<R> {
    fn recompute(&mut self) {
        self.status = if !self.is_enabled {
            AsyncDebouncerStatus::Disabled
        } else if self.is_executing {
            AsyncDebouncerStatus::Executing
        } else if self.is_pending {
            AsyncDebouncerStatus::Pending
        } else {
            AsyncDebouncerStatus::Idle
        };
    }
}

/// Async debouncer configuration
#[derive(Clone)]
pub struct AsyncDebouncerOptions<R> {
    /// Quiet period before the trailing edge fires
    pub wait: Setting<Duration, AsyncDebouncerState<R>>,
    /// Fire immediately on the first offer of a burst
    pub leading: bool,
    /// Fire with the latest args once the burst goes quiet
    pub trailing: bool,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, AsyncDebouncerState<R>>,
    /// Called with each successful result
    pub on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    /// Called with each execution error
    pub on_error: Option<Arc<dyn Fn(&PacerError) + Send + Sync>>,
    /// Called after each execution settles either way
    pub on_settled: Option<Arc<dyn Fn(&AsyncDebouncerState<R>) + Send + Sync>>,
    /// Whether awaiting callers see `Err` on operation failure.
    /// Defaults to true without an `on_error` handler, false with one.
    pub throw_on_error: Option<bool>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&AsyncDebouncerState<R>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<AsyncDebouncerState<R>>,
}

impl<R> Default for AsyncDebouncerOptions<R> {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(300).into(),
            leading: false,
            trailing: true,
            enabled: true.into(),
            on_success: None,
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

impl<R> AsyncDebouncerOptions<R> {
    /// Set the quiet period
    pub fn with_wait(
        mut self,
        wait: impl Into<Setting<Duration, AsyncDebouncerState<R>>>,
    ) -> Self {
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
    pub fn with_enabled(
        mut self,
        enabled: impl Into<Setting<bool, AsyncDebouncerState<R>>>,
    ) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Called with each successful result
    pub fn with_on_success(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
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
        f: impl Fn(&AsyncDebouncerState<R>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Force or suppress `Err` results for awaiting callers
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
        f: impl Fn(&AsyncDebouncerState<R>) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: AsyncDebouncerState<R>) -> Self {
        self.initial_state = Some(state);
        self
    }

    fn throws(&self) -> bool {
        self.throw_on_error.unwrap_or(self.on_error.is_none())
    }
}

type AsyncOp<A, R> =
    Arc<dyn Fn(A, CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;
type Waiter<R> = oneshot::Sender<Result<Option<R>, PacerError>>;

struct AsyncDebouncerCore<A, R> {
    options: AsyncDebouncerOptions<R>,
    last_args: Option<A>,
    timer: Option<TimerId>,
    timer_epoch: u64,
    waiters: Vec<Waiter<R>>,
    current_token: Option<CancellationToken>,
}

struct AsyncDebouncerInner<A, R> {
    op: AsyncOp<A, R>,
    core: Mutex<AsyncDebouncerCore<A, R>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<AsyncDebouncerState<R>>,
}

/// Debouncer over an async operation with awaitable results.
///
/// Cheap to clone; clones share the same state.
pub struct AsyncDebouncer<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncDebouncerInner<A, R>>,
}

impl<A, R> Clone for AsyncDebouncer<A, R>
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

impl<A, R> AsyncDebouncer<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create an async debouncer around `op`. Each execution receives a
    /// cancellation token it should honour for prompt aborts.
    pub fn new<Op, Fut>(op: Op, options: AsyncDebouncerOptions<R>) -> Self
    where
        Op: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(AsyncDebouncerInner {
                op: Arc::new(move |args, token| Box::pin(op(args, token))),
                core: Mutex::new(AsyncDebouncerCore {
                    options,
                    last_args: None,
                    timer: None,
                    timer_epoch: 0,
                    waiters: Vec::new(),
                    current_token: None,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Offer arguments. Resolves with the most recent completed invocation's
    /// result once this burst settles, `Ok(None)` when superseded, cancelled,
    /// or the error was routed to `on_error`, and `Err` when the execution
    /// failed with `throw_on_error` in effect.
    pub async fn maybe_execute(&self, args: A) -> Result<Option<R>, PacerError> {
        let (rx, leading_args) = {
            let mut core = lock_or_recover(&self.inner.core);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                AsyncDebouncerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
                core.last_args = None;
                self.inner.state.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                });
                drop(core);
                self.inner.publish();
                return Ok(None);
            }

            core.last_args = Some(args.clone());
            let (tx, rx) = oneshot::channel();
            core.waiters.push(tx);

            let mut did_leading = false;
            if core.options.leading && self.inner.state.with(|s| s.can_leading_execute) {
                self.inner.state.update(|s| s.can_leading_execute = false);
                did_leading = true;
            }
            if core.options.trailing && !did_leading {
                self.inner.state.update(|s| s.is_pending = true);
            }

            let wait = core.options.wait.resolve(&self.inner.state.get());
            AsyncDebouncerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
            AsyncDebouncerInner::arm_timer(&self.inner, &mut core, wait);
            (rx, did_leading.then(|| args))
        };
        self.inner.publish();

        if let Some(args) = leading_args {
            self.inner.execute(args).await;
        }
        rx.await.unwrap_or(Ok(None))
    }

    /// Execute a pending trailing invocation immediately and await it
    pub async fn flush(&self) -> Result<Option<R>, PacerError> {
        let (args, rx) = {
            let mut core = lock_or_recover(&self.inner.core);
            if self.inner.state.with(|s| s.is_pending) {
                AsyncDebouncerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
                self.inner.state.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                });
                let (tx, rx) = oneshot::channel();
                core.waiters.push(tx);
                (core.last_args.take(), Some(rx))
            } else {
                (None, None)
            }
        };
        self.inner.publish();

        if let Some(args) = args {
            self.inner.execute(args).await;
        }
        match rx {
            Some(rx) => rx.await.unwrap_or(Ok(None)),
            None => Ok(None),
        }
    }

    /// Abandon the pending invocation and signal the in-flight one to stop.
    /// Outstanding callers resolve with `Ok(None)`.
    pub fn cancel(&self) {
        let waiters = {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncDebouncerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
            if let Some(token) = core.current_token.take() {
                token.cancel();
            }
            std::mem::take(&mut core.waiters)
        };
        self.inner.state.update(|s| {
            s.is_pending = false;
            s.can_leading_execute = true;
        });
        for waiter in waiters {
            let _ = waiter.send(Ok(None));
        }
        self.inner.publish();
    }

    /// Cancel and restore the default state (counters included)
    pub fn reset(&self) {
        self.cancel();
        self.inner.state.replace(AsyncDebouncerState::default());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut AsyncDebouncerOptions<R>)) {
        let disabled = {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
            !enabled
        };
        if disabled {
            self.cancel();
        } else {
            self.inner.publish();
        }
    }

    /// Current state snapshot
    pub fn get_state(&self) -> AsyncDebouncerState<R> {
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

    /// Whether the operation is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.with(|s| s.is_executing)
    }

    /// Result of the most recent successful execution
    pub fn peek_last_result(&self) -> Option<R> {
        self.inner.state.with(|s| s.last_result.clone())
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

impl<A, R> AsyncDebouncerInner<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn on_timer(this: &Arc<Self>, epoch: u64) {
        let trailing_args = {
            let mut core = lock_or_recover(&this.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
            let enabled = core.options.enabled.resolve(&this.state.get());
            let was_pending = this.state.with(|s| s.is_pending);
            this.state.update(|s| {
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
            let inner = this.clone();
            tokio::spawn(async move {
                inner.execute(args).await;
            });
        }
        this.publish();
    }

    async fn execute(&self, args: A) {
        let token = CancellationToken::new();
        {
            let mut core = lock_or_recover(&self.core);
            core.current_token = Some(token.clone());
        }
        self.state.update(|s| s.is_executing = true);
        self.publish();

        let outcome = tokio::select! {
            outcome = (self.op)(args, token.clone()) => Some(outcome),
            _ = token.cancelled() => None,
        };

        let (waiters, on_success, on_error, on_settled, throws) = {
            let mut core = lock_or_recover(&self.core);
            core.current_token = None;
            (
                std::mem::take(&mut core.waiters),
                core.options.on_success.clone(),
                core.options.on_error.clone(),
                core.options.on_settled.clone(),
                core.options.throws(),
            )
        };

        match outcome {
            Some(Ok(value)) => {
                self.state.update(|s| {
                    s.is_executing = false;
                    s.success_count += 1;
                    s.settle_count += 1;
                    s.last_result = Some(value.clone());
                });
                for waiter in waiters {
                    let _ = waiter.send(Ok(Some(value.clone())));
                }
                if let Some(f) = on_success {
                    f(&value);
                }
            }
            Some(Err(error)) => {
                let error = PacerError::operation(error);
                self.state.update(|s| {
                    s.is_executing = false;
                    s.error_count += 1;
                    s.settle_count += 1;
                });
                log_debug!("async debouncer execution failed: {}", error.clone());
                for waiter in waiters {
                    let _ = waiter.send(if throws {
                        Err(error.clone())
                    } else {
                        Ok(None)
                    });
                }
                if let Some(f) = on_error {
                    f(&error);
                }
            }
            None => {
                self.state.update(|s| {
                    s.is_executing = false;
                    s.settle_count += 1;
                });
                for waiter in waiters {
                    let _ = waiter.send(Ok(None));
                }
            }
        }

        if let Some(f) = on_settled {
            f(&self.state.get());
        }
        self.publish();
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut AsyncDebouncerCore<A, R>, wait: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    AsyncDebouncerInner::on_timer(&inner, epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut AsyncDebouncerCore<A, R>, scheduler: &Arc<dyn TimerScheduler>) {
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
            observer.state_changed(PrimitiveKind::AsyncDebouncer, key.as_deref());
        }
    }
}

impl<A, R> Drop for AsyncDebouncerInner<A, R> {
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

    #[tokio::test(start_paused = true)]
    async fn test_trailing_result_fans_out() {
        let d: AsyncDebouncer<u32, u32> = AsyncDebouncer::new(
            |v: u32, _token| async move { Ok(v * 10) },
            AsyncDebouncerOptions::default().with_wait(Duration::from_millis(100)),
        );

        let d1 = d.clone();
        let first = tokio::spawn(async move { d1.maybe_execute(1).await });
        let d2 = d.clone();
        let second = tokio::spawn(async move { d2.maybe_execute(2).await });

        // both callers resolve with the trailing execution's result
        assert_eq!(first.await.unwrap().unwrap(), Some(20));
        assert_eq!(second.await.unwrap().unwrap(), Some(20));
        assert_eq!(d.get_state().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_throws_by_default() {
        let d: AsyncDebouncer<u32, u32> = AsyncDebouncer::new(
            |_v: u32, _token| async move { anyhow::bail!("boom") },
            AsyncDebouncerOptions::default().with_wait(Duration::from_millis(10)),
        );

        let result = d.maybe_execute(1).await;
        assert!(result.is_err());
        assert_eq!(d.get_state().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error_swallows() {
        let d: AsyncDebouncer<u32, u32> = AsyncDebouncer::new(
            |_v: u32, _token| async move { anyhow::bail!("boom") },
            AsyncDebouncerOptions::default()
                .with_wait(Duration::from_millis(10))
                .with_on_error(|_err| {}),
        );

        let result = d.maybe_execute(1).await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(d.get_state().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_waiters_with_none() {
        let d: AsyncDebouncer<u32, u32> = AsyncDebouncer::new(
            |v: u32, _token| async move { Ok(v) },
            AsyncDebouncerOptions::default().with_wait(Duration::from_secs(60)),
        );

        let d2 = d.clone();
        let waiting = tokio::spawn(async move { d2.maybe_execute(5).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.cancel();

        assert_eq!(waiting.await.unwrap().unwrap(), None);
        assert_eq!(d.get_state().success_count, 0);
    }
}
