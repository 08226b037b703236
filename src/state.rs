//! Observable state snapshots
//!
//! Every primitive owns a [`StateCell`]: a thread-safe snapshot store with a
//! single mutation path and a subscriber registry. Consumers always receive
//! copies; nothing hands out a reference into the live state.
//!
//! Mutation and notification are decoupled: [`StateCell::update`] mutates and
//! recomputes derived fields, and the owning primitive calls
//! [`StateCell::notify`] once per externally-observable transition, after its
//! own lock is released. Observers therefore only ever see consistent
//! snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use crate::lock::{read_or_recover, write_or_recover};

/// Unique identifier for a state subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

type SubscriberCallback = Arc<dyn Fn() + Send + Sync>;
type Subscribers = Arc<RwLock<HashMap<SubscriptionId, SubscriberCallback>>>;

/// Handle to a state subscription that unsubscribes when dropped
///
/// # Example
///
/// ```rust,ignore
/// let sub = debouncer.subscribe(|| println!("changed!"));
/// // notifications arrive while `sub` is in scope
/// drop(sub); // unsubscribed
/// ```
pub struct Subscription {
    id: SubscriptionId,
    subscribers: Subscribers,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        write_or_recover(&self.subscribers).remove(&self.id);
    }
}

/// States that recompute derived fields after each mutation
pub trait DerivedState {
    /// Recompute derived fields (status, sizes, exceeded flags) from the
    /// primary ones. Called on the single mutation path, never by consumers.
    fn recompute(&mut self) {}
}

/// Snapshot store with a single mutation path
pub struct StateCell<S> {
    value: RwLock<S>,
    subscribers: Subscribers,
}

impl<S: Clone + DerivedState> StateCell<S> {
    /// Create a cell holding `initial` (derived fields recomputed)
    pub fn new(mut initial: S) -> Self {
        initial.recompute();
        Self {
            value: RwLock::new(initial),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Current snapshot (a copy)
    pub fn get(&self) -> S {
        read_or_recover(&self.value).clone()
    }

    /// Run `f` against the current snapshot without cloning
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&read_or_recover(&self.value))
    }

    /// Mutate through the single setter; derived fields are recomputed
    /// before the write lock is released. Does not notify.
    pub fn update(&self, f: impl FnOnce(&mut S)) {
        let mut value = write_or_recover(&self.value);
        f(&mut value);
        value.recompute();
    }

    /// Replace the whole state (used by `reset`)
    pub fn replace(&self, mut next: S) {
        next.recompute();
        *write_or_recover(&self.value) = next;
    }

    /// Invoke every subscriber. Callbacks are cloned out of the registry
    /// first so a subscriber may unsubscribe (or subscribe) reentrantly.
    pub fn notify(&self) {
        let callbacks: Vec<SubscriberCallback> =
            read_or_recover(&self.subscribers).values().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Register a change callback; dropped [`Subscription`] unsubscribes
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = SubscriptionId::next();
        write_or_recover(&self.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: self.subscribers.clone(),
        }
    }
}
