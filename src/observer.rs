//! Change-notification sink
//!
//! An [`Observer`] receives `(kind, key)` tags whenever an instance publishes
//! a state change. It is an external collaborator: the core never depends on
//! what the sink does with the events, and a no-op sink is valid.

use std::sync::Arc;

/// Which primitive produced a change event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// Synchronous debouncer
    Debouncer,
    /// Asynchronous debouncer
    AsyncDebouncer,
    /// Synchronous throttler
    Throttler,
    /// Asynchronous throttler
    AsyncThrottler,
    /// Synchronous rate limiter
    RateLimiter,
    /// Asynchronous rate limiter
    AsyncRateLimiter,
    /// Synchronous queuer
    Queuer,
    /// Asynchronous queuer
    AsyncQueuer,
    /// Synchronous batcher
    Batcher,
    /// Asynchronous batcher
    AsyncBatcher,
    /// Retry companion
    AsyncRetryer,
}

impl PrimitiveKind {
    /// Display label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Debouncer => "Debouncer",
            Self::AsyncDebouncer => "AsyncDebouncer",
            Self::Throttler => "Throttler",
            Self::AsyncThrottler => "AsyncThrottler",
            Self::RateLimiter => "RateLimiter",
            Self::AsyncRateLimiter => "AsyncRateLimiter",
            Self::Queuer => "Queuer",
            Self::AsyncQueuer => "AsyncQueuer",
            Self::Batcher => "Batcher",
            Self::AsyncBatcher => "AsyncBatcher",
            Self::AsyncRetryer => "AsyncRetryer",
        }
    }
}

/// Sink receiving state-change notifications
pub trait Observer: Send + Sync {
    /// An instance of `kind` (identified by its optional `key`) published a
    /// state change. The new snapshot is readable from the instance itself.
    fn state_changed(&self, kind: PrimitiveKind, key: Option<&str>);
}

/// Observer that discards every notification
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn state_changed(&self, _kind: PrimitiveKind, _key: Option<&str>) {}
}

impl<F> Observer for F
where
    F: Fn(PrimitiveKind, Option<&str>) + Send + Sync,
{
    fn state_changed(&self, kind: PrimitiveKind, key: Option<&str>) {
        self(kind, key)
    }
}

/// Shared observer handle
pub type ObserverHandle = Arc<dyn Observer>;
