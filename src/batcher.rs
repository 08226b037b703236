//! Batcher: accumulate items and hand them off on a trigger
//!
//! Items accumulate until any trigger fires: the batch reaches `max_size`,
//! the `wait` timer armed at the first admission elapses, or the
//! `get_should_execute` predicate returns true. The batch is snapshotted and
//! cleared before the operation runs, so re-entrant admissions land in the
//! next batch.
//!
//! Optional in-batch deduplication drops or replaces items whose key is
//! already pending (`keep-first` / `keep-last`).
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{Batcher, BatcherOptions};
//! use std::time::Duration;
//!
//! let writes = Batcher::new(
//!     |batch: Vec<Row>| insert_many(&batch),
//!     BatcherOptions::default()
//!         .with_max_size(100)
//!         .with_wait(Duration::from_millis(50)),
//! );
//!
//! writes.add_item(row); // flushed with its cohort within 50ms
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// What happens when an admitted item's key is already in the pending batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeduplicateStrategy {
    /// Ignore the new item; the first-seen one keeps its position
    #[default]
    KeepFirst,
    /// Replace the existing item in place, preserving its position
    KeepLast,
}

/// Batch status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BatcherStatus {
    /// Triggers are suspended; items accumulate
    Stopped,
    /// No timer armed
    #[default]
    Idle,
    /// The wait timer is armed
    Pending,
}

/// Read-only batcher state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatcherState<T> {
    /// Items in the pending batch, admission order
    pub items: Vec<T>,
    /// Whether the wait timer is armed
    pub is_pending: bool,
    /// Whether triggers fire (flipped by `start`/`stop`)
    pub is_running: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Number of batch invocations
    pub execution_count: usize,
    /// Total items handed to the operation across all batches
    pub total_items_processed: usize,
    /// Keep-first dedup collisions
    pub rejection_count: usize,
    /// Derived: pending batch length
    pub size: usize,
    /// Derived: whether the pending batch is empty
    pub is_empty: bool,
    /// Derived status
    pub status: BatcherStatus,
}

impl<T> Default for BatcherState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            is_pending: false,
            is_running: true,
            is_enabled: true,
            execution_count: 0,
            total_items_processed: 0,
            rejection_count: 0,
            size: 0,
            is_empty: true,
            status: BatcherStatus::Idle,
        }
    }
}

impl<T: Clone> DerivedState for BatcherState<T> {
    fn recompute(&mut self) {
        self.size = self.items.len();
        self.is_empty = self.size == 0;
        self.status = if !self.is_running {
            BatcherStatus::Stopped
        } else if self.is_pending {
            BatcherStatus::Pending
        } else {
            BatcherStatus::Idle
        };
    }
}

/// Batcher configuration
#[derive(Clone)]
pub struct BatcherOptions<T> {
    /// Size trigger: execute when the batch reaches this many items
    pub max_size: Setting<usize, BatcherState<T>>,
    /// Time trigger: `None` disables it; otherwise a timer armed at the
    /// first admission of a batch fires after this long
    pub wait: Setting<Option<Duration>, BatcherState<T>>,
    /// Predicate trigger, evaluated after each admission
    pub get_should_execute: Option<Arc<dyn Fn(&[T], &BatcherState<T>) -> bool + Send + Sync>>,
    /// Whether triggers fire from the start (default true)
    pub started: bool,
    /// Drop or replace items whose key is already pending
    pub deduplicate_items: bool,
    /// Collision handling (default keep-first)
    pub deduplicate_strategy: DeduplicateStrategy,
    /// Key derivation; falls back to item equality when unset
    pub get_item_key: Option<Arc<dyn Fn(&T) -> String + Send + Sync>>,
    /// Called with each executed batch
    pub on_execute: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
    /// Called per keep-first collision
    pub on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called when the pending batch changes
    pub on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
    /// Master switch for admission, resolved at each `add_item`
    pub enabled: Setting<bool, BatcherState<T>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&BatcherState<T>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<BatcherState<T>>,
}

impl<T> Default for BatcherOptions<T> {
    fn default() -> Self {
        Self {
            max_size: usize::MAX.into(),
            wait: None.into(),
            get_should_execute: None,
            started: true,
            deduplicate_items: false,
            deduplicate_strategy: DeduplicateStrategy::KeepFirst,
            get_item_key: None,
            on_execute: None,
            on_reject: None,
            on_items_change: None,
            enabled: true.into(),
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
            initial_state: None,
        }
    }
}

impl<T> BatcherOptions<T> {
    /// Set the size trigger
    pub fn with_max_size(mut self, max_size: impl Into<Setting<usize, BatcherState<T>>>) -> Self {
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
        wait: impl Into<Setting<Option<Duration>, BatcherState<T>>>,
    ) -> Self {
        self.wait = wait.into();
        self
    }

    /// Set the predicate trigger
    pub fn with_get_should_execute(
        mut self,
        f: impl Fn(&[T], &BatcherState<T>) -> bool + Send + Sync + 'static,
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

    /// Called with each executed batch
    pub fn with_on_execute(mut self, f: impl Fn(&[T]) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
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

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, BatcherState<T>>>) -> Self {
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
        f: impl Fn(&BatcherState<T>) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: BatcherState<T>) -> Self {
        self.initial_state = Some(state);
        self
    }
}

struct BatcherCore<T> {
    options: BatcherOptions<T>,
    timer: Option<TimerId>,
    timer_epoch: u64,
}

struct BatcherInner<T, F> {
    op: Mutex<Option<F>>,
    core: Mutex<BatcherCore<T>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<BatcherState<T>>,
}

/// Accumulates items and hands them to a batch operation when a size, time,
/// or predicate trigger fires.
///
/// Cheap to clone; clones share the same state.
pub struct Batcher<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(Vec<T>) + Send + 'static,
{
    inner: Arc<BatcherInner<T, F>>,
}

impl<T, F> Clone for Batcher<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(Vec<T>) + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, F> Batcher<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(Vec<T>) + Send + 'static,
{
    /// Create a batcher around `op`
    pub fn new(op: F, options: BatcherOptions<T>) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        Self {
            inner: Arc::new(BatcherInner {
                op: Mutex::new(Some(op)),
                core: Mutex::new(BatcherCore {
                    options,
                    timer: None,
                    timer_epoch: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        }
    }

    /// Admit an item; returns false on a keep-first dedup collision
    pub fn add_item(&self, item: T) -> bool {
        BatcherInner::admit(&self.inner, item)
    }

    /// Execute the pending batch now, regardless of triggers
    pub fn flush(&self) {
        let batch = {
            let mut core = lock_or_recover(&self.inner.core);
            BatcherInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
            self.inner.take_batch()
        };
        if let Some(batch) = batch {
            self.inner.run_batch(batch);
        }
        self.inner.publish();
    }

    /// Discard the wait timer; the pending batch is kept
    pub fn cancel(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            BatcherInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| s.is_pending = false);
        self.inner.publish();
    }

    /// Discard the pending batch and the timer; counters are kept
    pub fn clear(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            BatcherInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| {
            s.items.clear();
            s.is_pending = false;
        });
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Restore the default state (counters included)
    pub fn reset(&self) {
        let started = {
            let mut core = lock_or_recover(&self.inner.core);
            BatcherInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
            core.options.started
        };
        let mut fresh = BatcherState::default();
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
                BatcherInner::evaluate_triggers(&self.inner, &mut core)
            }
        };
        if let Some(batch) = run_now {
            self.inner.run_batch(batch);
        }
        self.inner.publish();
    }

    /// Suspend triggers; items keep accumulating
    pub fn stop(&self) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            BatcherInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
        }
        self.inner.state.update(|s| {
            s.is_running = false;
            s.is_pending = false;
        });
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut BatcherOptions<T>)) {
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

    /// Whether triggers fire
    pub fn is_running(&self) -> bool {
        self.inner.state.with(|s| s.is_running)
    }

    /// Number of batch invocations
    pub fn execution_count(&self) -> usize {
        self.inner.state.with(|s| s.execution_count)
    }

    /// Total items handed to the operation
    pub fn total_items_processed(&self) -> usize {
        self.inner.state.with(|s| s.total_items_processed)
    }

    /// Current state snapshot
    pub fn get_state(&self) -> BatcherState<T> {
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

impl<T, F> BatcherInner<T, F>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(Vec<T>) + Send + 'static,
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
                            // replace in place; admission position is kept
                            this.state.update(|s| s.items[index] = item.clone());
                            let batch = Self::evaluate_triggers(this, &mut core);
                            drop(core);
                            this.items_changed();
                            if let Some(batch) = batch {
                                this.run_batch(batch);
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
            this.run_batch(batch);
        }
        this.publish();
        true
    }

    /// Check size and predicate triggers; arm the time trigger on the first
    /// admission of a batch. Returns a batch to execute, already cleared
    /// from the pending state.
    fn evaluate_triggers(self_arc: &Arc<Self>, core: &mut BatcherCore<T>) -> Option<Vec<T>> {
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

    fn on_timer(&self, epoch: u64) {
        let batch = {
            let mut core = lock_or_recover(&self.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
            self.take_batch()
        };
        if let Some(batch) = batch {
            self.run_batch(batch);
        }
        self.publish();
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

    fn run_batch(&self, batch: Vec<T>) {
        self.state.update(|s| {
            s.execution_count += 1;
            s.total_items_processed += batch.len();
        });
        log_debug!(
            "batcher executed {} item(s) ({} batches total)",
            batch.len(),
            self.state.with(|s| s.execution_count)
        );
        let on_execute = lock_or_recover(&self.core).options.on_execute.clone();
        let op = lock_or_recover(&self.op).take();
        if let Some(mut f) = op {
            f(batch.clone());
            *lock_or_recover(&self.op) = Some(f);
        }
        if let Some(f) = on_execute {
            f(&batch);
        }
        self.items_changed();
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut BatcherCore<T>, wait: Duration) {
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

    fn clear_timer(core: &mut BatcherCore<T>, scheduler: &Arc<dyn TimerScheduler>) {
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
            observer.state_changed(PrimitiveKind::Batcher, key.as_deref());
        }
    }
}

impl<T, F> Drop for BatcherInner<T, F> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = core.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}
