//! Queuer: ordered storage with pacing, priorities, and TTL expiration
//!
//! Items are admitted at the front or back (FIFO, LIFO, or deque usage),
//! optionally kept sorted by a priority function, and optionally expired by
//! age or a custom predicate. While running, a tick loop pops one item at a
//! time and hands it to the wrapped operation, spacing invocations by `wait`.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{Queuer, QueuerOptions};
//! use std::time::Duration;
//!
//! let uploads = Queuer::new(
//!     |path: PathBuf| upload(&path),
//!     QueuerOptions::default()
//!         .with_wait(Duration::from_secs(1))
//!         .with_max_size(100),
//! );
//!
//! uploads.add_item("a.png".into());
//! uploads.add_item("b.png".into()); // runs one second after a.png
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::option::Setting;
use crate::scheduler::{TimerId, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Which end of the queue an operation applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Position {
    /// Index 0
    Front,
    /// The last index
    Back,
}

/// Processing status of a queuer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueuerStatus {
    /// Not processing; items accumulate
    Stopped,
    /// Running with no tick active
    #[default]
    Idle,
    /// Running with a tick active or scheduled
    Busy,
}

/// Read-only queuer state snapshot
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueuerState<T> {
    /// Queued items, front first
    pub items: Vec<T>,
    /// Admission time of each item, parallel to `items`
    pub item_timestamps: Vec<Duration>,
    /// Whether the tick loop may process items
    pub is_running: bool,
    /// Whether a tick is active or scheduled
    pub pending_tick: bool,
    /// Last resolution of the `enabled` option
    pub is_enabled: bool,
    /// Number of invocations of the wrapped operation
    pub execution_count: usize,
    /// Number of items rejected because the queue was full
    pub rejection_count: usize,
    /// Number of items dropped by expiration
    pub expiration_count: usize,
    /// Derived: current queue length
    pub size: usize,
    /// Derived: whether the queue is empty
    pub is_empty: bool,
    /// Derived status
    pub status: QueuerStatus,
}

impl<T> Default for QueuerState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            item_timestamps: Vec::new(),
            is_running: true,
            pending_tick: false,
            is_enabled: true,
            execution_count: 0,
            rejection_count: 0,
            expiration_count: 0,
            size: 0,
            is_empty: true,
            status: QueuerStatus::Idle,
        }
    }
}

impl<T: Clone> DerivedState for QueuerState<T> {
    fn recompute(&mut self) {
        self.size = self.items.len();
        self.is_empty = self.size == 0;
        self.status = if !self.is_running {
            QueuerStatus::Stopped
        } else if self.pending_tick {
            QueuerStatus::Busy
        } else {
            QueuerStatus::Idle
        };
    }
}

/// Queuer configuration
#[derive(Clone)]
pub struct QueuerOptions<T> {
    /// Default insertion end (default back)
    pub add_items_to: Position,
    /// Default processing end (default front)
    pub get_items_from: Position,
    /// Capacity; admissions beyond it are rejected
    pub max_size: usize,
    /// Spacing between processed items
    pub wait: Setting<Duration, QueuerState<T>>,
    /// Whether processing starts immediately (default true)
    pub started: bool,
    /// Sort admissions by descending priority
    pub get_priority: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    /// Items admitted at construction
    pub initial_items: Vec<T>,
    /// Items older than this are expired at each tick
    pub expiration_duration: Option<Duration>,
    /// Custom expiration predicate `(item, added_at)`
    pub get_is_expired: Option<Arc<dyn Fn(&T, Duration) -> bool + Send + Sync>>,
    /// Called per expired item
    pub on_expire: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called per rejected item
    pub on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called per processed item
    pub on_execute: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    /// Called when `start`/`stop` flips the running flag
    pub on_is_running_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    /// Called with the items whenever their composition changes
    pub on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
    /// Master switch for admission, resolved at each `add_item`
    pub enabled: Setting<bool, QueuerState<T>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&QueuerState<T>) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
    /// Starting state merged over the defaults
    pub initial_state: Option<QueuerState<T>>,
}

impl<T> Default for QueuerOptions<T> {
    fn default() -> Self {
        Self {
            add_items_to: Position::Back,
            get_items_from: Position::Front,
            max_size: usize::MAX,
            wait: Duration::ZERO.into(),
            started: true,
            get_priority: None,
            initial_items: Vec::new(),
            expiration_duration: None,
            get_is_expired: None,
            on_expire: None,
            on_reject: None,
            on_execute: None,
            on_is_running_change: None,
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

impl<T> QueuerOptions<T> {
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

    /// Space processed items by `wait`
    pub fn with_wait(mut self, wait: impl Into<Setting<Duration, QueuerState<T>>>) -> Self {
        self.wait = wait.into();
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

    /// Admit these items at construction
    pub fn with_initial_items(mut self, items: Vec<T>) -> Self {
        self.initial_items = items;
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

    /// Called per processed item
    pub fn with_on_execute(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    /// Called when the running flag flips
    pub fn with_on_is_running_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_is_running_change = Some(Arc::new(f));
        self
    }

    /// Called when the item composition changes
    pub fn with_on_items_change(mut self, f: impl Fn(&[T]) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    /// Set the enabled switch
    pub fn with_enabled(mut self, enabled: impl Into<Setting<bool, QueuerState<T>>>) -> Self {
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
        f: impl Fn(&QueuerState<T>) + Send + Sync + 'static,
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
    pub fn with_initial_state(mut self, state: QueuerState<T>) -> Self {
        self.initial_state = Some(state);
        self
    }
}

struct QueuerCore<T> {
    options: QueuerOptions<T>,
    timer: Option<TimerId>,
    timer_epoch: u64,
}

struct QueuerInner<T, F> {
    op: Mutex<Option<F>>,
    core: Mutex<QueuerCore<T>>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<QueuerState<T>>,
}

/// Ordered storage with optional pacing, priorities, and TTL expiration.
///
/// Cheap to clone; clones share the same state.
pub struct Queuer<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    inner: Arc<QueuerInner<T, F>>,
}

impl<T, F> Clone for Queuer<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum TickStep<T> {
    /// Queue empty or stopped; tick loop ends
    Exit,
    /// One item popped for processing, plus the post-pop wait
    Process(T, Duration),
}

impl<T, F> Queuer<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    /// Create a queuer around `op`; initial items are admitted immediately
    /// and, when `started`, processing begins before `new` returns
    pub fn new(op: F, options: QueuerOptions<T>) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        let now = scheduler.now();
        for item in &options.initial_items {
            initial.items.push(item.clone());
            initial.item_timestamps.push(now);
        }
        let queuer = Self {
            inner: Arc::new(QueuerInner {
                op: Mutex::new(Some(op)),
                core: Mutex::new(QueuerCore {
                    options,
                    timer: None,
                    timer_epoch: 0,
                }),
                scheduler,
                state: StateCell::new(initial),
            }),
        };
        QueuerInner::kick(&queuer.inner);
        queuer
    }

    /// Admit an item at the configured end; returns false when full
    pub fn add_item(&self, item: T) -> bool {
        QueuerInner::insert(&self.inner, item, None)
    }

    /// Admit an item at an explicit end; returns false when full
    pub fn add_item_to(&self, item: T, position: Position) -> bool {
        QueuerInner::insert(&self.inner, item, Some(position))
    }

    /// Resume processing; queued items are kept
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
            QueuerInner::kick(&self.inner);
        }
    }

    /// Pause processing; no items are lost
    pub fn stop(&self) {
        let flipped = {
            let mut core = lock_or_recover(&self.inner.core);
            if !self.inner.state.with(|s| s.is_running) {
                false
            } else {
                QueuerInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
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

    /// Drop all queued items; counters are kept
    pub fn clear(&self) {
        self.inner.state.update(|s| {
            s.items.clear();
            s.item_timestamps.clear();
        });
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Drop items and counters; optionally repopulate the initial items
    pub fn reset(&self, with_initial_items: bool) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            QueuerInner::<T, F>::clear_timer(&mut core, &self.inner.scheduler);
            let mut fresh = QueuerState::default();
            fresh.is_running = core.options.started;
            if with_initial_items {
                let now = self.inner.scheduler.now();
                for item in &core.options.initial_items {
                    fresh.items.push(item.clone());
                    fresh.item_timestamps.push(now);
                }
            }
            self.inner.state.replace(fresh);
        }
        self.inner.items_changed();
        self.inner.publish();
        QueuerInner::kick(&self.inner);
    }

    /// Pop and process one item synchronously, bypassing the wait
    pub fn execute(&self) -> Option<T> {
        self.execute_from(None)
    }

    /// Pop and process one item from an explicit end
    pub fn execute_from(&self, position: Option<Position>) -> Option<T> {
        self.inner.expire_items();
        let item = {
            let core = lock_or_recover(&self.inner.core);
            let position = position.unwrap_or(core.options.get_items_from);
            self.inner.pop(position)
        };
        if let Some(ref item) = item {
            self.inner.invoke(item.clone());
        }
        self.inner.publish();
        item
    }

    /// Process up to `n` items immediately, bypassing the wait
    pub fn flush_n(&self, n: usize) {
        self.inner.expire_items();
        for _ in 0..n {
            let item = {
                let core = lock_or_recover(&self.inner.core);
                self.inner.pop(core.options.get_items_from)
            };
            match item {
                Some(item) => self.inner.invoke(item),
                None => break,
            }
        }
        self.inner.publish();
    }

    /// Process every queued item immediately, bypassing the wait
    pub fn flush(&self) {
        self.flush_n(usize::MAX);
    }

    /// Hand every queued item to `batch_op` in one call, clearing the queue
    pub fn flush_as_batch(&self, batch_op: impl FnOnce(Vec<T>)) {
        self.inner.expire_items();
        let items = {
            let mut drained = Vec::new();
            self.inner.state.update(|s| {
                drained = std::mem::take(&mut s.items);
                s.item_timestamps.clear();
                s.execution_count += 1;
            });
            drained
        };
        batch_op(items);
        self.inner.items_changed();
        self.inner.publish();
    }

    /// Next item that would be processed, without removing it
    pub fn peek_next_item(&self) -> Option<T> {
        let position = lock_or_recover(&self.inner.core).options.get_items_from;
        self.peek_next_item_from(position)
    }

    /// Next item from an explicit end, without removing it
    pub fn peek_next_item_from(&self, position: Position) -> Option<T> {
        self.inner.state.with(|s| match position {
            Position::Front => s.items.first().cloned(),
            Position::Back => s.items.last().cloned(),
        })
    }

    /// Copy of all queued items, front first
    pub fn peek_all_items(&self) -> Vec<T> {
        self.inner.state.with(|s| s.items.clone())
    }

    /// Current queue length
    pub fn size(&self) -> usize {
        self.inner.state.with(|s| s.size)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.state.with(|s| s.is_empty)
    }

    /// Whether the queue is at capacity
    pub fn is_full(&self) -> bool {
        let max_size = lock_or_recover(&self.inner.core).options.max_size;
        self.inner.state.with(|s| s.size >= max_size)
    }

    /// Whether the tick loop may process items
    pub fn is_running(&self) -> bool {
        self.inner.state.with(|s| s.is_running)
    }

    /// Running with nothing queued
    pub fn is_idle(&self) -> bool {
        self.inner.state.with(|s| s.is_running && s.is_empty)
    }

    /// Number of invocations of the wrapped operation
    pub fn execution_count(&self) -> usize {
        self.inner.state.with(|s| s.execution_count)
    }

    /// Mutate the options; takes effect on the next use
    pub fn set_options(&self, f: impl FnOnce(&mut QueuerOptions<T>)) {
        {
            let mut core = lock_or_recover(&self.inner.core);
            f(&mut core.options);
            let enabled = core.options.enabled.resolve(&self.inner.state.get());
            self.inner.state.update(|s| s.is_enabled = enabled);
        }
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> QueuerState<T> {
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

impl<T, F> QueuerInner<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn insert(this: &Arc<Self>, item: T, position: Option<Position>) -> bool {
        let (admitted, start_tick) = {
            let core = lock_or_recover(&this.core);
            let enabled = core.options.enabled.resolve(&this.state.get());
            this.state.update(|s| s.is_enabled = enabled);
            if !enabled {
                drop(core);
                this.publish();
                return false;
            }

            if this.state.with(|s| s.size) >= core.options.max_size {
                this.state.update(|s| s.rejection_count += 1);
                let on_reject = core.options.on_reject.clone();
                drop(core);
                if let Some(f) = on_reject {
                    f(&item);
                }
                this.publish();
                return false;
            }

            let now = this.scheduler.now();
            let get_priority = core.options.get_priority.clone();
            let index = match get_priority {
                Some(priority_of) => {
                    // first slot whose item has strictly lower priority keeps
                    // equal-priority admissions in arrival order
                    let p = priority_of(&item);
                    this.state.with(|s| {
                        s.items
                            .iter()
                            .position(|other| priority_of(other) < p)
                            .unwrap_or(s.items.len())
                    })
                }
                None => match position.unwrap_or(core.options.add_items_to) {
                    Position::Front => 0,
                    Position::Back => this.state.with(|s| s.items.len()),
                },
            };
            this.state.update(|s| {
                s.items.insert(index, item.clone());
                s.item_timestamps.insert(index, now);
            });

            let start_tick = this.state.with(|s| s.is_running && !s.pending_tick);
            if start_tick {
                this.state.update(|s| s.pending_tick = true);
            }
            (true, start_tick)
        };

        this.items_changed();
        this.publish();
        if start_tick {
            Self::tick(this);
        }
        admitted
    }

    /// Begin ticking if running, non-empty, and no tick is active
    fn kick(this: &Arc<Self>) {
        let start_tick = {
            let _core = lock_or_recover(&this.core);
            let start = this
                .state
                .with(|s| s.is_running && !s.pending_tick && !s.is_empty);
            if start {
                this.state.update(|s| s.pending_tick = true);
            }
            start
        };
        if start_tick {
            Self::tick(this);
        }
    }

    /// Process items until the queue drains, processing stops, or a wait
    /// timer takes over the chain.
    fn tick(this: &Arc<Self>) {
        loop {
            this.expire_items();
            let step = {
                let mut core = lock_or_recover(&this.core);
                if !this.state.with(|s| s.is_running) || this.state.with(|s| s.is_empty) {
                    this.state.update(|s| s.pending_tick = false);
                    TickStep::Exit
                } else {
                    match this.pop(core.options.get_items_from) {
                        Some(item) => {
                            let wait = core.options.wait.resolve(&this.state.get());
                            if wait > Duration::ZERO {
                                Self::arm_timer(this, &mut core, wait);
                            }
                            TickStep::Process(item, wait)
                        }
                        None => {
                            this.state.update(|s| s.pending_tick = false);
                            TickStep::Exit
                        }
                    }
                }
            };

            match step {
                TickStep::Exit => {
                    this.publish();
                    return;
                }
                TickStep::Process(item, wait) => {
                    this.invoke(item);
                    this.items_changed();
                    this.publish();
                    if wait > Duration::ZERO {
                        // the armed timer continues the chain
                        return;
                    }
                }
            }
        }
    }

    fn on_timer(this: &Arc<Self>, epoch: u64) {
        {
            let mut core = lock_or_recover(&this.core);
            if core.timer_epoch != epoch {
                return;
            }
            core.timer = None;
        }
        Self::tick(this);
    }

    /// Remove one item from the given end; does not touch counters
    fn pop(&self, position: Position) -> Option<T> {
        let mut popped = None;
        self.state.update(|s| {
            if s.items.is_empty() {
                return;
            }
            let index = match position {
                Position::Front => 0,
                Position::Back => s.items.len() - 1,
            };
            popped = Some(s.items.remove(index));
            s.item_timestamps.remove(index);
        });
        popped
    }

    fn invoke(&self, item: T) {
        self.state.update(|s| s.execution_count += 1);
        log_debug!(
            "queuer processed item ({} total)",
            self.state.with(|s| s.execution_count)
        );
        let on_execute = lock_or_recover(&self.core).options.on_execute.clone();
        let op = lock_or_recover(&self.op).take();
        if let Some(mut f) = op {
            f(item.clone());
            *lock_or_recover(&self.op) = Some(f);
        }
        if let Some(f) = on_execute {
            f(&item);
        }
    }

    /// Drop expired items rear-to-front in one pass
    fn expire_items(&self) {
        let (expired, on_expire) = {
            let core = lock_or_recover(&self.core);
            if core.options.expiration_duration.is_none() && core.options.get_is_expired.is_none() {
                return;
            }
            let expiration_duration = core.options.expiration_duration;
            let get_is_expired = core.options.get_is_expired.clone();
            let on_expire = core.options.on_expire.clone();
            let now = self.scheduler.now();

            let mut expired = Vec::new();
            self.state.update(|s| {
                for i in (0..s.items.len()).rev() {
                    let added_at = s.item_timestamps[i];
                    let by_predicate = get_is_expired
                        .as_ref()
                        .map_or(false, |f| f(&s.items[i], added_at));
                    let by_age = expiration_duration
                        .map_or(false, |d| now.saturating_sub(added_at) > d);
                    if by_predicate || by_age {
                        expired.push(s.items.remove(i));
                        s.item_timestamps.remove(i);
                        s.expiration_count += 1;
                    }
                }
            });
            (expired, on_expire)
        };

        if !expired.is_empty() {
            log_debug!("queuer expired {} item(s)", expired.len());
            if let Some(f) = on_expire {
                for item in &expired {
                    f(item);
                }
            }
            self.items_changed();
            self.publish();
        }
    }

    fn arm_timer(self_arc: &Arc<Self>, core: &mut QueuerCore<T>, wait: Duration) {
        core.timer_epoch += 1;
        let epoch = core.timer_epoch;
        let weak = Arc::downgrade(self_arc);
        core.timer = Some(self_arc.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    QueuerInner::on_timer(&inner, epoch);
                }
            }),
        ));
    }

    fn clear_timer(core: &mut QueuerCore<T>, scheduler: &Arc<dyn TimerScheduler>) {
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
            observer.state_changed(PrimitiveKind::Queuer, key.as_deref());
        }
    }
}

impl<T, F> Drop for QueuerInner<T, F> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = core.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}
