//! Async throttler: windowed invocation with an awaitable result
//!
//! Same wait-window spacing as [`Throttler`](crate::Throttler), but the
//! wrapped operation is async. Callers whose offers are superseded by a
//! newer offer resolve immediately with the most recent completed result;
//! only the caller holding the latest args awaits the trailing execution.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncThrottler, AsyncThrottlerOptions};
//! use std::time::Duration;
//!
//! let save = AsyncThrottler::new(
//!     |doc: Document, _token| async move { persist(&doc).await },
//!     AsyncThrottlerOptions::default().with_wait(Duration::from_secs(2)),
//! );
//!
//! save.maybe_execute(doc).await?; // at most one persist per 2s
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

/// Execution status of an async throttler
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncThrottlerStatus {
    /// Offers are ignored while `enabled` resolves false
    Disabled,
    /// Nothing pending
    #[default]
    Idle,
    /// A trailing invocation is waiting on the window timer
    Pending,
    /// The operation is in flight
    Executing,
}

/// Read-only async throttler state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AsyncThrottlerState<R> {
    /// Scheduler time of the most recent invocation
    pub last_execution_time: Option<Duration>,
    /// Earliest scheduler time the next leading invocation may run
    pub next_execution_time: Option<Duration>,
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
    pub status: AsyncThrottlerStatus,
}

impl<R> Default for AsyncThrottlerState<R> {
    fn default() -> Self {
        Self {
            last_execution_time: None,
            next_execution_time: None,
            is_pending: false,
            is_executing: false,
            is_enabled: true,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            last_result: None,
            status: AsyncThrottlerStatus::Idle,
        }
    }
}

impl<R: Clone> DerivedState for AsyncThrottlerState<R> {
    fn recompute(&mut self) {
        self.status = if !self.is_enabled {
            AsyncThrottlerStatus::Disabled
        } else if self.is_executing {
            AsyncThrottlerStatus::Executing
        } else if self.is_pending {
            AsyncThrottlerStatus::Pending
        } else {
            AsyncThrottlerStatus::Idle
        };
    }
}

/// Async throttler configuration
#[derive(Clone)]
pub struct AsyncThrottlerOptions<R> {
    /// Minimum spacing between invocations
    pub wait: Setting<Duration, AsyncThrottlerState<R>>,
    /// Fire immediately when the window allows (default true)
    pub leading: bool,
    /// Fire deferred offers at the end of the window (default true)
    pub trailing: bool,
    /// Master switch, resolved at each offer
    pub enabled: Setting<bool, AsyncThrottlerState<R>>,
    /// Called with each successful result
    pub on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    /// Called with each execution error
    pub on_error: Option<Arc<dyn Fn(&PacerError) + Send + Sync>>,
    /// Called after each execution settles either way
    pub on_settled: Option<Arc<dyn Fn(&AsyncThrottlerState<R>) + Send + Sync>>,
    /// Whether awaiting callers see `Err` on operation failure.
    /// Defaults to true without an `on_error` handler, false with one.
    pub throw_on_error: Option<bool>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&AsyncThrottlerState<R>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<AsyncThrottlerState<R>>,
}

impl<R> Default for AsyncThrottlerOptions<R> {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(100).into(),
            leading: true,
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

impl<R> AsyncThrottlerOptions<R> {
    /// Set the window width
    pub fn with_wait(
        mut self,
        wait: impl Into<Setting<Duration, AsyncThrottlerState<R>>>,
    ) -> Self {
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
    pub fn with_enabled(
        mut self,
        enabled: impl Into<Setting<bool, AsyncThrottlerState<R>>>,
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
        f: impl Fn(&AsyncThrottlerState<R>) + Send + Sync + 'static,
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
        f: impl Fn(&AsyncThrottlerState<R>) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: AsyncThrottlerState<R>) -> Self {
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

struct AsyncThrottlerCore<A, R> {
    options: AsyncThrottlerOptions<R>,
    last_args: Option<A>,
    timer: Option<TimerId>,
    timer_epoch: u64,
    waiters: Vec<Waiter<R>>,
    current_token: Option<CancellationToken>,
}

struct AsyncThrottlerInner<A, R> {
    op: AsyncOp<A, R>,
    core: Mutex<AsyncThrottlerCore<A, R>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<AsyncThrottlerState<R>>,
}

/// Throttler over an async operation with awaitable results.
///
/// Cheap to clone; clones share the same state.
pub struct AsyncThrottler<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncThrottlerInner<A, R>>,
}

impl<A, R> Clone for AsyncThrottler<A, R>
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

impl<A, R> AsyncThrottler<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create an async throttler around `op`
    pub fn new<Op, Fut>(op: Op, options: AsyncThrottlerOptions<R>) -> Self
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
            inner: Arc::new(AsyncThrottlerInner {
                op: Arc::new(move |args, token| Box::pin(op(args, token))),
                core: Mutex::new(AsyncThrottlerCore {
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

    /// Offer arguments. Leading offers execute immediately; offers landing
    /// inside the window await the trailing execution. An offer superseded
    /// by a newer one resolves right away with the most recent completed
    /// result.
    pub async fn maybe_execute(&self, args: A) -> Result<Option<R>, PacerError> {
        let (rx, leading_args, superseded) = {
            let mut core = lock_or_recover(&self.inner.core);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                AsyncThrottlerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
                core.last_args = None;
                self.inner.state.update(|s| s.is_pending = false);
                drop(core);
                self.inner.publish();
                return Ok(None);
            }

            // supersede earlier callers with the latest completed result
            let superseded = std::mem::take(&mut core.waiters);
            let (tx, rx) = oneshot::channel();
            core.waiters.push(tx);

            let now = self.inner.scheduler.now();
            let wait = core.options.wait.resolve(&self.inner.state.get());
            let elapsed = self
                .inner
                .state
                .with(|s| s.last_execution_time)
                .map(|t| now - t);
            let window_open = elapsed.map_or(true, |e| e >= wait);

            if core.options.leading && window_open {
                (rx, Some(args), superseded)
            } else {
                core.last_args = Some(args);
                if core.options.trailing {
                    self.inner.state.update(|s| s.is_pending = true);
                    if core.timer.is_none() {
                        let delay = elapsed.map_or(Duration::ZERO, |e| wait.saturating_sub(e));
                        AsyncThrottlerInner::arm_timer(&self.inner, &mut core, delay);
                    }
                }
                (rx, None, superseded)
            }
        };

        let last_result = self.inner.state.with(|s| s.last_result.clone());
        for waiter in superseded {
            let _ = waiter.send(Ok(last_result.clone()));
        }
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
                AsyncThrottlerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
                self.inner.state.update(|s| s.is_pending = false);
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

    /// Abandon the pending trailing invocation; window spacing is kept.
    /// Outstanding callers resolve with `Ok(None)`.
    pub fn cancel(&self) {
        let waiters = {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncThrottlerInner::<A, R>::clear_timer(&mut core, &self.inner.scheduler);
            core.last_args = None;
            if let Some(token) = core.current_token.take() {
                token.cancel();
            }
            std::mem::take(&mut core.waiters)
        };
        self.inner.state.update(|s| s.is_pending = false);
        for waiter in waiters {
            let _ = waiter.send(Ok(None));
        }
        self.inner.publish();
    }

    /// Cancel and restore the default state (counters and spacing included)
    pub fn reset(&self) {
        self.cancel();
        self.inner.state.replace(AsyncThrottlerState::default());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut AsyncThrottlerOptions<R>)) {
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
    pub fn get_state(&self) -> AsyncThrottlerState<R> {
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

    /// Observer key, if configured
    pub fn key(&self) -> Option<String> {
        lock_or_recover(&self.inner.core).options.key.clone()
    }
}

impl<A, R> AsyncThrottlerInner<A, R>
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
        let now = self.scheduler.now();
        let wait = {
            let mut core = lock_or_recover(&self.core);
            core.current_token = Some(token.clone());
            core.options.wait.resolve(&self.state.get())
        };
        self.state.update(|s| {
            s.is_executing = true;
            s.last_execution_time = Some(now);
            s.next_execution_time = Some(now + wait);
        });
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
                log_debug!("async throttler execution failed: {}", error.clone());
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

    fn arm_timer(self_arc: &Arc<Self>, core: &mut AsyncThrottlerCore<A, R>, delay: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    AsyncThrottlerInner::on_timer(&inner, epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut AsyncThrottlerCore<A, R>, scheduler: &Arc<dyn TimerScheduler>) {
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
            observer.state_changed(PrimitiveKind::AsyncThrottler, key.as_deref());
        }
    }
}

impl<A, R> Drop for AsyncThrottlerInner<A, R> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = core.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}
