//! Async queuer: paced queue processing with bounded concurrency
//!
//! Same admission rules as [`Queuer`](crate::Queuer) (front/back insertion,
//! priorities, TTL expiration, capacity rejection), but items are processed
//! by an async operation with up to `concurrency` executions in flight.
//! Admission order is preserved; settlement order is not once
//! `concurrency > 1`.
//!
//! Every admitted item yields an [`ItemReceipt`], a future resolving with
//! that item's settled result.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncQueuer, AsyncQueuerOptions};
//!
//! let workers = AsyncQueuer::new(
//!     |job: Job, _token| async move { run(job).await },
//!     AsyncQueuerOptions::default().with_concurrency(4),
//! );
//!
//! let receipt = workers.add_item(job).expect("queue full");
//! let outcome = receipt.await?; // this job's own result
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::PacerError;
use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::queuer::Position;
use crate::retry::{AsyncRetryer, RetryOptions};
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Processing status of an async queuer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncQueuerStatus {
    /// Not processing; items accumulate
    Stopped,
    /// Running with nothing in flight
    #[default]
    Idle,
    /// Running with executions in flight or a tick scheduled
    Busy,
}

/// Read-only async queuer state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AsyncQueuerState<T> {
    /// Pending items, front first
    pub items: Vec<T>,
    /// Admission time of each pending item, parallel to `items`
    pub item_timestamps: Vec<Duration>,
    /// Items currently being processed
    pub active_items: Vec<T>,
    /// Whether processing may start new items
    pub is_running: bool,
    /// Whether a pacing timer is armed
    pub pending_tick: bool,
    /// Whether any execution is in flight
    pub is_executing: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Invocations started
    pub execution_count: usize,
    /// Executions that resolved successfully
    pub success_count: usize,
    /// Executions that failed after exhausting their retries
    pub error_count: usize,
    /// Executions that settled either way
    pub settle_count: usize,
    /// Items rejected because the queue was full
    pub rejection_count: usize,
    /// Items dropped by expiration
    pub expiration_count: usize,
    /// Derived: pending queue length
    pub size: usize,
    /// Derived: whether the pending queue is empty
    pub is_empty: bool,
    /// Derived status
    pub status: AsyncQueuerStatus,
}

impl<T> Default for AsyncQueuerState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            item_timestamps: Vec::new(),
            active_items: Vec::new(),
            is_running: true,
            pending_tick: false,
            is_executing: false,
            is_enabled: true,
            execution_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            rejection_count: 0,
            expiration_count: 0,
            size: 0,
            is_empty: true,
            status: AsyncQueuerStatus::Idle,
        }
    }
}

impl<T: Clone> DerivedState for AsyncQueuerState<T> {
    fn recompute(&mut self) {
        self.size = self.items.len();
        self.is_empty = self.size == 0;
        self.is_executing = !self.active_items.is_empty();
        self.status = if !self.is_running {
            AsyncQueuerStatus::Stopped
        } else if self.is_executing || self.pending_tick {
            AsyncQueuerStatus::Busy
        } else {
            AsyncQueuerStatus::Idle
        };
    }
}

/// Async queuer configuration
#[derive(Clone)]
pub struct AsyncQueuerOptions<T, R> {
    /// Default insertion end (default back)
    pub add_items_to: Position,
    /// Default processing end (default front)
    pub get_items_from: Position,
    /// Capacity; admissions beyond it are rejected
    pub max_size: usize,
    /// Spacing between started items
    pub wait: Setting<Duration, AsyncQueuerState<T>>,
    /// Executions allowed in flight at once (>= 1)
    pub concurrency: usize,
    /// Whether processing starts immediately (default true)
    pub started: bool,
    /// Sort admissions by descending priority
    pub get_priority: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    /// Items older than this are expired
    pub expiration_duration: Option<Duration>,
    /// Custom expiration predicate `(item, added_at)`
    pub get_is_expired: Option<Arc<dyn Fn(&T, Duration) -> bool + Send + Sync>>,
    /// Per-item retry policy (default: one attempt, no retries)
    pub retry: RetryOptions,
    /// Called per expired item
    pub on_expire: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called per rejected item
    pub on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called per successful item with its result
    pub on_success: Option<Arc<dyn Fn(&T, &R) + Send + Sync>>,
    /// Called per failed item with its error
    pub on_error: Option<Arc<dyn Fn(&T, &PacerError) + Send + Sync>>,
    /// Called after each item settles either way
    pub on_settled: Option<Arc<dyn Fn(&AsyncQueuerState<T>) + Send + Sync>>,
    /// Called when `start`/`stop` flips the running flag
    pub on_is_running_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    /// Called when the pending item composition changes
    pub on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
    /// Whether receipts resolve `Err` on operation failure.
    /// Defaults to true without an `on_error` handler, false with one.
    pub throw_on_error: Option<bool>,
    /// Master switch for admission, resolved at each `add_item`
    pub enabled: Setting<bool, AsyncQueuerState<T>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&AsyncQueuerState<T>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults; item fields are ignored
    pub initial_state: Option<AsyncQueuerState<T>>,
}

impl<T, R> Default for AsyncQueuerOptions<T, R> {
    fn default() -> Self {
        Self {
            add_items_to: Position::Back,
            get_items_from: Position::Front,
            max_size: usize::MAX,
            wait: Duration::ZERO.into(),
            concurrency: 1,
            started: true,
            get_priority: None,
            expiration_duration: None,
            get_is_expired: None,
            retry: RetryOptions::single_attempt(),
            on_expire: None,
            on_reject: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            on_is_running_change: None,
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

impl<T, R> AsyncQueuerOptions<T, R> {
    /// Set the default insertion end
    pub fn with_add_items_to(mut self, position: Position) -> Self {
        self.add_items_to = position;
        self
    }

    /// Set the default processing end
    pub fn with_get_items_from(mut self, position: Position) -> Self {
        self.get_items_from = position;
        self
    }

    /// Cap the queue length
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Space started items by `wait`
    pub fn with_wait(mut self, wait: impl Into<Setting<Duration, AsyncQueuerState<T>>>) -> Self {
        self.wait = wait.into();
        self
    }

    /// Allow up to this many executions in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Construct stopped instead of running
    pub fn with_started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Keep items sorted by descending priority
    pub fn with_get_priority(mut self, f: impl Fn(&T) -> i64 + Send + Sync + 'static) -> Self {
        self.get_priority = Some(Arc::new(f));
        self
    }

    /// Expire items older than this
    pub fn with_expiration_duration(mut self, duration: Duration) -> Self {
        self.expiration_duration = Some(duration);
        self
    }

    /// Expire items matching a predicate `(item, added_at)`
    pub fn with_get_is_expired(
        mut self,
        f: impl Fn(&T, Duration) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.get_is_expired = Some(Arc::new(f));
        self
    }

    /// Set the per-item retry policy
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Called per expired item
    pub fn with_on_expire(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(f));
        self
    }

    /// Called per rejected item
    pub fn with_on_reject(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }

    /// Called per successful item with its result
    pub fn with_on_success(mut self, f: impl Fn(&T, &R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called per failed item with its error
    pub fn with_on_error(mut self, f: impl Fn(&T, &PacerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after each item settles
    pub fn with_on_settled(
        mut self,
        f: impl Fn(&AsyncQueuerState<T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Called when the running flag flips
    pub fn with_on_is_running_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_is_running_change = Some(Arc::new(f));
        self
    }

    /// Called when the pending item composition changes
    pub fn with_on_items_change(mut self, f: impl Fn(&[T]) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    /// Force or suppress `Err` results on receipts
    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = Some(throw_on_error);
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, AsyncQueuerState<T>>>) -> Self {
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
        f: impl Fn(&AsyncQueuerState<T>) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: AsyncQueuerState<T>) -> Self {
        self.initial_state = Some(state);
        self
    }

    fn throws(&self) -> bool {
        self.throw_on_error.unwrap_or(self.on_error.is_none())
    }
}

/// Future resolving with one admitted item's settled result.
///
/// Resolves `Ok(Some(result))` on success, `Ok(None)` when the item was
/// cleared, expired, aborted, or its error was routed to `on_error`, and
/// `Err` when the execution failed with `throw_on_error` in effect.
pub struct ItemReceipt<R> {
    rx: oneshot::Receiver<Result<Option<R>, PacerError>>,
}

impl<R> Future for ItemReceipt<R> {
    type Output = Result<Option<R>, PacerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_closed)) => Poll::Ready(Ok(None)),
            Poll::Pending => Poll::Pending,
        }
    }
}

type Settler<R> = oneshot::Sender<Result<Option<R>, PacerError>>;
type AsyncOp<T, R> =
    Arc<dyn Fn(T, CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

struct QueueEntry<T, R> {
    item: T,
    added_at: Duration,
    settler: Settler<R>,
}

struct AsyncQueuerCore<T, R> {
    options: AsyncQueuerOptions<T, R>,
    /// Pending entries; `state.items` mirrors their items
    entries: Vec<QueueEntry<T, R>>,
    /// In-flight items and their retryers, keyed by task sequence number
    active: HashMap<u64, T>,
    retryers: HashMap<u64, AsyncRetryer>,
    task_seq: u64,
    timer: Option<TimerId>,
    timer_epoch: u64,
}

struct AsyncQueuerInner<T, R> {
    op: AsyncOp<T, R>,
    core: Mutex<AsyncQueuerCore<T, R>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<AsyncQueuerState<T>>,
}

/// Queue processor over an async operation with bounded concurrency.
///
/// Cheap to clone; clones share the same state.
pub struct AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncQueuerInner<T, R>>,
}

impl<T, R> Clone for AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create an async queuer around `op`
    pub fn new<Op, Fut>(op: Op, options: AsyncQueuerOptions<T, R>) -> Self
    where
        Op: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.items.clear();
        initial.item_timestamps.clear();
        initial.active_items.clear();
        initial.pending_tick = false;
        initial.is_running = options.started;
        Self {
            inner: Arc::new(AsyncQueuerInner {
                op: Arc::new(move |item, token| Box::pin(op(item, token))),
                core: Mutex::new(AsyncQueuerCore {
                    options,
                    entries: Vec::new(),
                    active: HashMap::new(),
                    retryers: HashMap::new(),
                    task_seq: 0,
                    timer: None,
                    timer_epoch: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Admit an item at the configured end. `None` means the queue was full
    /// (or admission disabled); otherwise the receipt resolves with this
    /// item's settled result.
    pub fn add_item(&self, item: T) -> Option<ItemReceipt<R>> {
        AsyncQueuerInner::insert(&self.inner, item, None)
    }

    /// Admit an item at an explicit end
    pub fn add_item_to(&self, item: T, position: Position) -> Option<ItemReceipt<R>> {
        AsyncQueuerInner::insert(&self.inner, item, Some(position))
    }

    /// Resume starting new items
    pub fn start(&self) {
        let flipped = {
            let _core = lock_or_recover(&self.inner.core);
            if self.inner.state.with(|s| s.is_running) {
                false
            } else {
                self.inner.state.update(|s| s.is_running = true);
                true
            }
        };
        if flipped {
            self.inner.running_changed(true);
            self.inner.publish();
            AsyncQueuerInner::maybe_process(&self.inner);
        }
    }

    /// Stop starting new items; in-flight executions continue
    pub fn stop(&self) {
        let flipped = {
            let mut core = lock_or_recover(&self.inner.core);
            if !self.inner.state.with(|s| s.is_running) {
                false
            } else {
                AsyncQueuerInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
                self.inner.state.update(|s| {
                    s.is_running = false;
                    s.pending_tick = false;
                });
                true
            }
        };
        if flipped {
            self.inner.running_changed(false);
            self.inner.publish();
        }
    }

    /// Drop all pending items; their receipts resolve `Ok(None)`
    pub fn clear(&self) {
        let dropped = {
            let mut core = lock_or_recover(&self.inner.core);
            let dropped: Vec<QueueEntry<T, R>> = core.entries.drain(..).collect();
            self.inner.sync_items(&core);
            dropped
        };
        for entry in dropped {
            let _ = entry.settler.send(Ok(None));
        }
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Abort in-flight executions and restore the default state
    pub fn reset(&self) {
        let (dropped, retryers) = {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncQueuerInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
            let dropped: Vec<QueueEntry<T, R>> = core.entries.drain(..).collect();
            let retryers: Vec<AsyncRetryer> = core.retryers.values().cloned().collect();
            let started = core.options.started;
            let mut fresh = AsyncQueuerState::default();
            fresh.is_running = started;
            self.inner.state.replace(fresh);
            (dropped, retryers)
        };
        for retryer in retryers {
            retryer.abort();
        }
        for entry in dropped {
            let _ = entry.settler.send(Ok(None));
        }
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Cancel the pacing timer and start as many pending items as the
    /// concurrency cap allows, immediately
    pub fn flush(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            AsyncQueuerInner::<T, R>::clear_timer(&mut core, &self.inner.scheduler);
            self.inner.state.update(|s| s.pending_tick = false);
        }
        AsyncQueuerInner::maybe_process(&self.inner);
    }

    /// Copy of the pending items, front first
    pub fn peek_pending_items(&self) -> Vec<T> {
        self.inner.state.with(|s| s.items.clone())
    }

    /// Copy of the items currently being processed
    pub fn peek_active_items(&self) -> Vec<T> {
        self.inner.state.with(|s| s.active_items.clone())
    }

    /// Next item that would start, without removing it
    pub fn peek_next_item(&self) -> Option<T> {
        let position = lock_or_recover(&self.inner.core).options.get_items_from;
        self.inner.state.with(|s| match position {
            Position::Front => s.items.first().cloned(),
            Position::Back => s.items.last().cloned(),
        })
    }

    /// Pending queue length
    pub fn size(&self) -> usize {
        self.inner.state.with(|s| s.size)
    }

    /// Whether the pending queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.state.with(|s| s.is_empty)
    }

    /// Whether new items may start
    pub fn is_running(&self) -> bool {
        self.inner.state.with(|s| s.is_running)
    }

    /// Whether any execution is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.with(|s| s.is_executing)
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut AsyncQueuerOptions<T, R>)) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> AsyncQueuerState<T> {
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

enum StartStep<T, R> {
    Exit,
    Started {
        seq: u64,
        item: T,
        settler: Settler<R>,
        retryer: AsyncRetryer,
        chained: bool,
    },
}

impl<T, R> AsyncQueuerInner<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn insert(this: &Arc<Self>, item: T, position: Option<Position>) -> Option<ItemReceipt<R>> {
        let receipt = {
            let mut core = lock_or_recover(&this.core);
            let enabled = core.options.enabled.resolve(&this.state.get());
            this.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                drop(core);
                this.publish();
                return None;
            }

            if core.entries.len() >= core.options.max_size {
                this.state.update(|s| s.rejection_count += 1);
                let on_reject = core.options.on_reject.clone();
                drop(core);
                if let Some(f) = on_reject {
                    f(&item);
                }
                this.publish();
                return None;
            }

            let now = this.scheduler.now();
            let index = match core.options.get_priority.clone() {
                Some(priority_of) => {
                    let p = priority_of(&item);
                    core.entries
                        .iter()
                        .position(|entry| priority_of(&entry.item) < p)
                        .unwrap_or(core.entries.len())
                }
                None => match position.unwrap_or(core.options.add_items_to) {
                    Position::Front => 0,
                    Position::Back => core.entries.len(),
                },
            };
            let (tx, rx) = oneshot::channel();
            core.entries.insert(
                index,
                QueueEntry {
                    item,
                    added_at: now,
                    settler: tx,
                },
            );
            this.sync_items(&core);
            ItemReceipt { rx }
        };

        this.items_changed();
        this.publish();
        Self::maybe_process(this);
        Some(receipt)
    }

    /// Start pending items while the concurrency cap, the running flag, and
    /// the pacing chain allow.
    fn maybe_process(this: &Arc<Self>) {
        loop {
            this.expire_items();
            let step = {
                let mut core = lock_or_recover(&this.core);
                let state_ok = this.state.with(|s| s.is_running && !s.pending_tick);
                if !state_ok
                    || core.entries.is_empty()
                    || core.active.len() >= core.options.concurrency
                {
                    StartStep::Exit
                } else {
                    let index = match core.options.get_items_from {
                        Position::Front => 0,
                        Position::Back => core.entries.len() - 1,
                    };
                    let entry = core.entries.remove(index);
                    this.sync_items(&core);

                    core.task_seq += 1;
                    let seq = core.task_seq;
                    core.active.insert(seq, entry.item.clone());
                    this.state.update(|s| {
                        s.execution_count += 1;
                        s.active_items.push(entry.item.clone());
                    });

                    let mut retry = core.options.retry.clone();
                    if retry.scheduler.is_none() {
                        retry.scheduler = Some(this.scheduler.clone());
                    }
                    let retryer = AsyncRetryer::new(retry);
                    core.retryers.insert(seq, retryer.clone());

                    let wait = core.options.wait.resolve(&this.state.get());
                    let chained = wait > Duration::ZERO;
                    if chained {
                        Self::arm_timer(this, &mut core, wait);
                        this.state.update(|s| s.pending_tick = true);
                    }
                    StartStep::Started {
                        seq,
                        item: entry.item,
                        settler: entry.settler,
                        retryer,
                        chained,
                    }
                }
            };

            match step {
                StartStep::Exit => {
                    this.publish();
                    return;
                }
                StartStep::Started {
                    seq,
                    item,
                    settler,
                    retryer,
                    chained,
                } => {
                    this.items_changed();
                    this.publish();
                    let inner = this.clone();
                    let op = this.op.clone();
                    tokio::spawn(async move {
                        let call_item = item.clone();
                        let result = retryer
                            .execute(move |token| op(call_item.clone(), token))
                            .await;
                        AsyncQueuerInner::on_task_settled(&inner, seq, item, settler, result);
                    });
                    if chained {
                        return;
                    }
                }
            }
        }
    }

    fn on_task_settled(
        this: &Arc<Self>,
        seq: u64,
        item: T,
        settler: Settler<R>,
        result: Result<R, PacerError>,
    ) {
        let (on_success, on_error, on_settled, throws) = {
            let mut core = lock_or_recover(&this.core);
            core.retryers.remove(&seq);
            core.active.remove(&seq);
            let actives: Vec<T> = core.active.values().cloned().collect();
            this.state.update(|s| s.active_items = actives);
            (
                core.options.on_success.clone(),
                core.options.on_error.clone(),
                core.options.on_settled.clone(),
                core.options.throws(),
            )
        };

        match result {
            Ok(value) => {
                this.state.update(|s| {
                    s.success_count += 1;
                    s.settle_count += 1;
                });
                let _ = settler.send(Ok(Some(value.clone())));
                if let Some(f) = on_success {
                    f(&item, &value);
                }
            }
            Err(PacerError::Aborted) => {
                this.state.update(|s| s.settle_count += 1);
                let _ = settler.send(Ok(None));
            }
            Err(error) => {
                this.state.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                });
                log_debug!("async queuer item failed: {}", error.clone());
                let _ = settler.send(if throws {
                    Err(error.clone())
                } else {
                    Ok(None)
                });
                if let Some(f) = on_error {
                    f(&item, &error);
                }
            }
        }

        if let Some(f) = on_settled {
            f(&this.state.get());
        }
        this.publish();
        Self::maybe_process(this);
    }

    fn on_timer(this: &Arc<Self>, epoch: u64) {
        {
            let mut core = lock_or_recover(&this.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
            this.state.update(|s| s.pending_tick = false);
        }
        Self::maybe_process(this);
    }

    /// Drop expired entries rear-to-front; receipts resolve `Ok(None)`
    fn expire_items(&self) {
        let (expired, on_expire) = {
            let mut core = lock_or_recover(&self.core);
            if core.options.expiration_duration.is_none() && core.options.get_is_expired.is_none() {
                return;
            }
            let expiration_duration = core.options.expiration_duration;
            let get_is_expired = core.options.get_is_expired.clone();
            let on_expire = core.options.on_expire.clone();
            let now = self.scheduler.now();

            let mut expired = Vec::new();
            for i in (0..core.entries.len()).rev() {
                let added_at = core.entries[i].added_at;
                let by_predicate = get_is_expired
                    .as_ref()
                    .map_or(false, |f| f(&core.entries[i].item, added_at));
                let by_age =
                    expiration_duration.map_or(false, |d| now.saturating_sub(added_at) > d);
                if by_predicate || by_age {
                    expired.push(core.entries.remove(i));
                }
            }
            if !expired.is_empty() {
                self.state
                    .update(|s| s.expiration_count += expired.len());
                self.sync_items(&core);
            }
            (expired, on_expire)
        };

        if !expired.is_empty() {
            log_debug!("async queuer expired {} item(s)", expired.len());
            for entry in expired {
                if let Some(f) = &on_expire {
                    f(&entry.item);
                }
                let _ = entry.settler.send(Ok(None));
            }
            self.items_changed();
            self.publish();
        }
    }

    /// Mirror `core.entries` into the state snapshot
    fn sync_items(&self, core: &AsyncQueuerCore<T, R>) {
        let items: Vec<T> = core.entries.iter().map(|e| e.item.clone()).collect();
        let stamps: Vec<Duration> = core.entries.iter().map(|e| e.added_at).collect();
        self.state.update(|s| {
            s.items = items;
            s.item_timestamps = stamps;
        });
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut AsyncQueuerCore<T, R>, wait: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    AsyncQueuerInner::on_timer(&inner, epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut AsyncQueuerCore<T, R>, scheduler: &Arc<dyn TimerScheduler>) {
        core.timer_epoch += 1;
        if let Some(id) = core.timer.take() {
            scheduler.cancel(id);
        }
    }

    fn running_changed(&self, running: bool) {
        let on_change = lock_or_recover(&self.core).options.on_is_running_change.clone();
        if let Some(f) = on_change {
            f(running);
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
            observer.state_changed(PrimitiveKind::AsyncQueuer, key.as_deref());
        }
    }
}

impl<T, R> Drop for AsyncQueuerInner<T, R> {
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_receipt_resolves_with_item_result() {
        let q: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            |v: u32, _token| async move { Ok(v * 2) },
            AsyncQueuerOptions::default(),
        );

        let receipt = q.add_item(21).unwrap();
        assert_eq!(receipt.await.unwrap(), Some(42));
        assert_eq!(q.get_state().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_caps_in_flight() {
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak_clone = peak.clone();
        let active_clone = active.clone();

        let q: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            move |v: u32, _token| {
                let peak = peak_clone.clone();
                let active = active_clone.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(v)
                }
            },
            AsyncQueuerOptions::default().with_concurrency(2),
        );

        let receipts: Vec<_> = (0..6).filter_map(|v| q.add_item(v)).collect();
        for receipt in receipts {
            receipt.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(q.get_state().settle_count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resolves_receipts_with_none() {
        let q: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            |v: u32, _token| async move { Ok(v) },
            AsyncQueuerOptions::default().with_started(false),
        );

        let receipt = q.add_item(1).unwrap();
        q.clear();
        assert_eq!(receipt.await.unwrap(), None);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_returns_none() {
        let q: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            |v: u32, _token| async move { Ok(v) },
            AsyncQueuerOptions::default()
                .with_started(false)
                .with_max_size(1),
        );

        assert!(q.add_item(1).is_some());
        assert!(q.add_item(2).is_none());
        assert_eq!(q.get_state().rejection_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_routed_to_on_error_resolves_none() {
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        let q: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            |_v: u32, _token| async move { anyhow::bail!("nope") },
            AsyncQueuerOptions::default().with_on_error(move |_item, _err| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let receipt = q.add_item(1).unwrap();
        assert_eq!(receipt.await.unwrap(), None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(q.get_state().error_count, 1);
    }
}
