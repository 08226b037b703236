//! Async batcher: size/time/predicate-triggered batches of async work
//!
//! Same triggers and deduplication as [`Batcher`](crate::Batcher), but the
//! batch operation is async, runs through an [`AsyncRetryer`], and can be
//! aborted mid-flight. Trigger-driven executions run on a spawned task;
//! [`flush`](AsyncBatcher::flush) runs inline and returns the batch result.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncBatcher, AsyncBatcherOptions};
//! use std::time::Duration;
//!
//! let inserts = AsyncBatcher::new(
//!     |rows: Vec<Row>, _token| async move { insert_many(rows).await },
//!     AsyncBatcherOptions::default()
//!         .with_max_size(500)
//!         .with_wait(Duration::from_millis(100)),
//! );
//!
//! inserts.add_item(row);
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::batcher::DeduplicateStrategy;
use crate::error::PacerError;
use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::retry::{AsyncRetryer, RetryOptions};
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Batch status of an async batcher
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncBatcherStatus {
    /// Triggers are suspended; items accumulate
    Stopped,
    /// No timer armed, nothing in flight
    #[default]
    Idle,
    /// The wait timer is armed
    Pending,
    /// A batch is in flight
    Executing,
}

/// Read-only async batcher state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AsyncBatcherState<T> {
    /// Items in the pending batch, admission order
    pub items: Vec<T>,
    /// Whether the wait timer is armed
    pub is_pending: bool,
    /// Whether a batch is in flight
    pub is_executing: bool,
    /// Whether triggers fire (flipped by `start`/`stop`)
    pub is_running: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Number of batch invocations
    pub execution_count: usize,
    /// Total items handed to the operation across all batches
    pub total_items_processed: usize,
    /// Batches that resolved successfully
    pub success_count: usize,
    /// Batches that failed after exhausting their retries
    pub error_count: usize,
    /// Batches that settled either way
    pub settle_count: usize,
    /// Keep-first dedup collisions
    pub rejection_count: usize,
    /// Derived: pending batch length
    pub size: usize,
    /// Derived: whether the pending batch is empty
    pub is_empty: bool,
    /// Derived status
    pub status: AsyncBatcherStatus,
}

impl<T> Default for AsyncBatcherState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            is_pending: false,
            is_executing: false,
            is_running: true,
            is_enabled: true,
            execution_count: 0,
            total_items_processed: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            rejection_count: 0,
            size: 0,
            is_empty: true,
            status: AsyncBatcherStatus::Idle,
        }
    }
}

impl<T: Clone> DerivedState for AsyncBatcherState<T> {
    fn recompute(&mut self) {
        self.size = self.items.len();
        self.is_empty = self.size == 0;
        self.status = if !self.is_running {
            AsyncBatcherStatus::Stopped
        } else if self.is_executing {
            AsyncBatcherStatus::Executing
        } else if self.is_pending {
            AsyncBatcherStatus::Pending
        } else {
            AsyncBatcherStatus::Idle
        };
    }
}

/// Async batcher configuration
#[derive(Clone)]
pub struct AsyncBatcherOptions<T, R> {
    /// Size trigger: execute when the batch reaches this many items
    pub max_size: Setting<usize, AsyncBatcherState<T>>,
    /// Time trigger: `None` disables it
    pub wait: Setting<Option<Duration>, AsyncBatcherState<T>>,
    /// Predicate trigger, evaluated after each admission
    pub get_should_execute:
        Option<Arc<dyn Fn(&[T], &AsyncBatcherState<T>) -> bool + Send + Sync>>,
    /// Whether triggers fire from the start (default true)
    pub started: bool,
    /// Drop or replace items whose key is already pending
    pub deduplicate_items: bool,
    /// Collision handling (default keep-first)
    pub deduplicate_strategy: DeduplicateStrategy,
    /// Key derivation; falls back to item equality when unset
    pub get_item_key: Option<Arc<dyn Fn(&T) -> String + Send + Sync>>,
    /// Per-batch retry policy (default: one attempt, no retries)
    pub retry: RetryOptions,
    /// Called with each successful batch result
    pub on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    /// Called with each batch error
    pub on_error: Option<Arc<dyn Fn(&PacerError) + Send + Sync>>,
    /// Called after each batch settles either way
    pub on_settled: Option<Arc<dyn Fn(&AsyncBatcherState<T>) + Send + Sync>>,
    /// Called per keep-first collision
    pub on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called when the pending batch changes
    pub on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
    /// Whether `flush` returns `Err` on operation failure.
    /// Defaults to true without an `on_error` handler, false with one.
    pub throw_on_error: Option<bool>,
    /// Master switch for admission, resolved at each `add_item`
    pub enabled: Setting<bool, AsyncBatcherState<T>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&AsyncBatcherState<T>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults; item fields are ignored
    pub initial_state: Option<AsyncBatcherState<T>>,
}

impl<T, R> Default for AsyncBatcherOptions<T, R> {
    fn default() -> Self {
        Self {
            max_size: usize::MAX.into(),
            wait: None.into(),
            get_should_execute: None,
            started: true,
            deduplicate_items: false,
            deduplicate_strategy: DeduplicateStrategy::KeepFirst,
            get_item_key: None,
            retry: RetryOptions::single_attempt(),
            on_success: None,
            on_error: None,
            on_settled: None,
            on_reject: None,
            on_items_change: None,
            throw_on_error: None,
            enabled: true.into(),
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
            initial_state: None,
        }
    }
}

impl<T, R> AsyncBatcherOptions<T, R> {
    /// Set the size trigger
    pub fn with_max_size(
        mut self,
        max_size: impl Into<Setting<usize, AsyncBatcherState<T>>>,
    ) -> Self {
        self.max_size = max_size.into();
        self
    }

    /// Set the time trigger
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait).into();
        self
    }

    /// Set a dynamic (or absent) time trigger
    pub fn with_wait_setting(
        mut self,
        wait: impl Into<Setting<Option<Duration>, AsyncBatcherState<T>>>,
    ) -> Self {
        self.wait = wait.into();
        self
    }

    /// Set the predicate trigger
    pub fn with_get_should_execute(
        mut self,
        f: impl Fn(&[T], &AsyncBatcherState<T>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.get_should_execute = Some(Arc::new(f));
        self
    }

    /// Construct stopped instead of running
    pub fn with_started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Enable in-batch deduplication
    pub fn with_deduplicate_items(mut self, deduplicate: bool) -> Self {
        self.deduplicate_items = deduplicate;
        self
    }

    /// Choose collision handling
    pub fn with_deduplicate_strategy(mut self, strategy: DeduplicateStrategy) -> Self {
        self.deduplicate_strategy = strategy;
        self
    }

    /// Derive dedup keys from items
    pub fn with_get_item_key(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.get_item_key = Some(Arc::new(f));
        self
    }

    /// Set the per-batch retry policy
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Called with each successful batch result
    pub fn with_on_success(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called with each batch error
    pub fn with_on_error(mut self, f: impl Fn(&PacerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after each batch settles
    pub fn with_on_settled(
        mut self,
        f: impl Fn(&AsyncBatcherState<T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Called per keep-first collision
    pub fn with_on_reject(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }

    /// Called when the pending batch changes
    pub fn with_on_items_change(mut self, f: impl Fn(&[T]) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    /// Force or suppress `Err` results from `flush`
    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = Some(throw_on_error);
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(
        mut self,
        enabled: impl Into<Setting<bool, AsyncBatcherState<T>>>,
    ) -> Self {
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
        f: impl Fn(&AsyncBatcherState<T>) + Send + Sync + 'static,
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

    /// Start from a non-default state (counters; item fields are ignored)
    pub fn with_initial_state(mut self, state: AsyncBatcherState<T>) -> Self {
        self.initial_state = Some(state);
        self
    }

    fn throws(&self) -> bool {
        self.throw_on_error.unwrap_or(self.on_error.is_none())
    }
}

type AsyncOp<T, R> =
    Arc<dyn Fn(Vec<T>, CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

struct AsyncBatcherCore<T, R> {
    options: AsyncBatcherOptions<T, R>,
    timer: Option<TimerId>,
    timer_epoch: u64,
    current_retryer: Option<AsyncRetryer>,
}

struct AsyncBatcherInner<T, R> {
    op: AsyncOp<T, R>,
    core: Mutex<AsyncBatcherCore<T, R>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<AsyncBatcherState<T>>,
}

/// Batcher over an async batch operation with retries and abort.
///
/// Cheap to clone; clones share the same state.
pub struct AsyncBatcher<T, R>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncBatcherInner<T, R>>,
}

impl<T, R> Clone for AsyncBatcher<T, R>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> AsyncBatcher<T, R>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create an async batcher around `op`
    pub fn new<Op, Fut>(op: Op, options: AsyncBatcherOptions<T, R>) -> Self
    where
        Op: Fn(Vec<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.items.clear();
        initial.is_pending = false;
        initial.is_executing = false;
        initial.is_running = options.started;
        Self {
            inner: Arc::new(AsyncBatcherInner {
                op: Arc::new(move |batch, token| Box::pin(op(batch, token))),
                core: Mutex::new(AsyncBatcherCore {
                    options,
                    timer: None,
                    timer_epoch: 0,
                    current_retryer: None,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Admit an item; returns false on a keep-first dedup collision.
    /// Trigger-driven executions run on a spawned task.
    pub fn add_item(&self, item: T) -> bool {
        AsyncBatcherInner::admit(&self.inner, item)
    }

    /// Execute the pending batch now and await its result
    pub async fn flush(&self) -> Result<Option<R>, PacerError> {
        let batch = {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncBatcherInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
            self.inner.take_batch()
        };
        self.inner.publish();
        match batch {
            Some(batch) => self.inner.run_batch(batch).await,
            None => Ok(None),
        }
    }

    /// Discard the wait timer; the pending batch is kept
    pub fn cancel(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncBatcherInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| s.is_pending = false);
        self.inner.publish();
    }

    /// Signal the in-flight batch to cancel
    pub fn abort(&self) {
        let retryer = lock_or_recover(&self.inner.core).current_retryer.clone();
        if let Some(retryer) = retryer {
            retryer.abort();
        }
    }

    /// Discard the pending batch and the timer; counters are kept
    pub fn clear(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncBatcherInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| {
            s.items.clear();
            s.is_pending = false;
        });
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Abort, then restore the default state (counters included)
    pub fn reset(&self) {
        self.abort();
        let started = {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncBatcherInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
            core.options.started
        };
        let mut fresh = AsyncBatcherState::default();
        fresh.is_running = started;
        self.inner.state.replace(fresh);
        self.inner.publish();
    }

    /// Resume triggers and re-evaluate them against the pending batch
    pub fn start(&self) {
        let run_now = {
            let mut core = lock_or_recover(&self.inner.core);
            if self.inner.state.with(|s| s.is_running) {
                None
            } else {
                self.inner.state.update(|s| s.is_running = true);
                AsyncBatcherInner::evaluate_triggers(&self.inner, &mut core)
            }
        };
        if let Some(batch) = run_now {
            AsyncBatcherInner::launch_batch(&self.inner, batch);
        }
        self.inner.publish();
    }

    /// Suspend triggers; items keep accumulating
    pub fn stop(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncBatcherInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| {
            s.is_running = false;
            s.is_pending = false;
        });
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut AsyncBatcherOptions<T, R>)) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
        }
        self.inner.publish();
    }

    /// Copy of the pending batch, admission order
    pub fn peek_all_items(&self) -> Vec<T> {
        self.inner.state.with(|s| s.items.clone())
    }

    /// Pending batch length
    pub fn size(&self) -> usize {
        self.inner.state.with(|s| s.size)
    }

    /// Whether the pending batch is empty
    pub fn is_empty(&self) -> bool {
        self.inner.state.with(|s| s.is_empty)
    }

    /// Whether the wait timer is armed
    pub fn is_pending(&self) -> bool {
        self.inner.state.with(|s| s.is_pending)
    }

    /// Whether a batch is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.with(|s| s.is_executing)
    }

    /// Current state snapshot
    pub fn get_state(&self) -> AsyncBatcherState<T> {
        self.inner.state.get()
    }

    /// Register a change callback
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe(f)
    }

    /// Observer key, if configured
    pub fn key(&self) -> Option<String> {
        lock_or_recover(&self.inner.core).options.key.clone()
    }
}

impl<T, R> AsyncBatcherInner<T, R>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn admit(this: &Arc<Self>, item: T) -> bool {
        let run_now = {
            let mut core = lock_or_recover(&this.core);
            let enabled = core.options.enabled.resolve(&this.state.get());
            this.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                drop(core);
                this.publish();
                return false;
            }

            if core.options.deduplicate_items {
                let get_key = core.options.get_item_key.clone();
                let duplicate_at = this.state.with(|s| match &get_key {
                    Some(key_of) => {
                        let key = key_of(&item);
                        s.items.iter().position(|other| key_of(other) == key)
                    }
                    None => s.items.iter().position(|other| *other == item),
                });
                if let Some(index) = duplicate_at {
                    match core.options.deduplicate_strategy {
                        DeduplicateStrategy::KeepFirst => {
                            this.state.update(|s| s.rejection_count += 1);
                            let on_reject = core.options.on_reject.clone();
                            drop(core);
                            if let Some(f) = on_reject {
                                f(&item);
                            }
                            this.publish();
                            return false;
                        }
                        DeduplicateStrategy::KeepLast => {
                            this.state.update(|s| s.items[index] = item.clone());
                            let batch = Self::evaluate_triggers(this, &mut core);
                            drop(core);
                            this.items_changed();
                            if let Some(batch) = batch {
                                Self::launch_batch(this, batch);
                            }
                            this.publish();
                            return true;
                        }
                    }
                }
            }

            this.state.update(|s| s.items.push(item));
            Self::evaluate_triggers(this, &mut core)
        };

        this.items_changed();
        if let Some(batch) = run_now {
            Self::launch_batch(this, batch);
        }
        this.publish();
        true
    }

    /// Check size and predicate triggers; arm the time trigger on the first
    /// admission of a batch
    fn evaluate_triggers(self_arc: &Arc<Self>, core: &mut AsyncBatcherCore<T, R>) -> Option<Vec<T>> {
        if !self_arc.state.with(|s| s.is_running) {
            return None;
        }
        let snapshot = self_arc.state.get();
        if snapshot.items.is_empty() {
            return None;
        }
        let max_size = core.options.max_size.resolve(&snapshot);
        let size_hit = snapshot.items.len() >= max_size;
        let predicate_hit = core
            .options
            .get_should_execute
            .as_ref()
            .map_or(false, |f| f(&snapshot.items, &snapshot));

        if size_hit || predicate_hit {
            Self::clear_timer(core, &self_arc.scheduler);
            return self_arc.take_batch();
        }

        if core.timer.is_none() {
            if let Some(wait) = core.options.wait.resolve(&snapshot) {
                Self::arm_timer(self_arc, core, wait);
                self_arc.state.update(|s| s.is_pending = true);
            }
        }
        None
    }

    fn on_timer(this: &Arc<Self>, epoch: u64) {
        let batch = {
            let mut core = lock_or_recover(&this.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
            this.take_batch()
        };
        if let Some(batch) = batch {
            Self::launch_batch(this, batch);
        }
        this.publish();
    }

    /// Snapshot and clear the pending batch before anything runs
    fn take_batch(&self) -> Option<Vec<T>> {
        let mut batch = Vec::new();
        self.state.update(|s| {
            batch = std::mem::take(&mut s.items);
            s.is_pending = false;
        });
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Run a batch on a spawned task (trigger-driven path)
    fn launch_batch(self_arc: &Arc<Self>, batch: Vec<T>) {
        let inner = self_arc.clone();
        tokio::spawn(async move {
            let _ = inner.run_batch(batch).await;
        });
    }

    async fn run_batch(&self, batch: Vec<T>) -> Result<Option<R>, PacerError> {
        let retryer = {
            let mut core = lock_or_recover(&self.core);
            let mut retry = core.options.retry.clone();
            if retry.scheduler.is_none() {
                retry.scheduler = Some(self.scheduler.clone());
            }
            let retryer = AsyncRetryer::new(retry);
            core.current_retryer = Some(retryer.clone());
            retryer
        };
        self.state.update(|s| {
            s.is_executing = true;
            s.execution_count += 1;
            s.total_items_processed += batch.len();
        });
        log_debug!(
            "async batcher executing {} item(s) ({} batches total)",
            batch.len(),
            self.state.with(|s| s.execution_count)
        );
        self.items_changed();
        self.publish();

        let op = self.op.clone();
        let call_batch = batch.clone();
        let result = retryer
            .execute(move |token| op(call_batch.clone(), token))
            .await;

        {
            let mut core = lock_or_recover(&self.core);
            core.current_retryer = None;
        }
        let (on_success, on_error, on_settled, throws) = {
            let core = lock_or_recover(&self.core);
            (
                core.options.on_success.clone(),
                core.options.on_error.clone(),
                core.options.on_settled.clone(),
                core.options.throws(),
            )
        };

        let outcome = match result {
            Ok(value) => {
                self.state.update(|s| {
                    s.is_executing = false;
                    s.success_count += 1;
                    s.settle_count += 1;
                });
                if let Some(f) = on_success {
                    f(&value);
                }
                Ok(Some(value))
            }
            Err(PacerError::Aborted) => {
                self.state.update(|s| {
                    s.is_executing = false;
                    s.settle_count += 1;
                });
                Ok(None)
            }
            Err(error) => {
                self.state.update(|s| {
                    s.is_executing = false;
                    s.error_count += 1;
                    s.settle_count += 1;
                });
                log_debug!("async batcher batch failed: {}", error.clone());
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

    fn arm_timer(self_arc: &Arc<Self>, core: &mut AsyncBatcherCore<T, R>, wait: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    AsyncBatcherInner::on_timer(&inner, epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut AsyncBatcherCore<T, R>, scheduler: &Arc<dyn TimerScheduler>) {
        core.timer_epoch += 1;
        if let Some(id) = core.timer.take() {
            scheduler.cancel(id);
        }
    }

    fn items_changed(&self) {
        let on_change = lock_or_recover(&self.core).options.on_items_change.clone();
        if let Some(f) = on_change {
            let items = self.state.with(|s| s.items.clone());
            f(&items);
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
            observer.state_changed(PrimitiveKind::AsyncBatcher, key.as_deref());
        }
    }
}

impl<T, R> Drop for AsyncBatcherInner<T, R> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = core.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}
