//! # Pacer
//!
//! Execution-pacing primitives for Rust: reusable objects that wrap a
//! user-supplied operation and interpose a policy deciding *whether, when,
//! and with what arguments* the operation actually runs.
//!
//! ## Primitives
//!
//! | Primitive | Policy |
//! |-----------|--------|
//! | [`Debouncer`] / [`AsyncDebouncer`] | Collapse bursts into one delayed invocation (leading/trailing edges) |
//! | [`Throttler`] / [`AsyncThrottler`] | At most one invocation per wait window |
//! | [`RateLimiter`] / [`AsyncRateLimiter`] | Up to `limit` invocations per window (fixed or sliding) |
//! | [`Queuer`] / [`AsyncQueuer`] | Ordered storage with pacing, priorities, and TTL expiration |
//! | [`Batcher`] / [`AsyncBatcher`] | Accumulate items; hand them off on size/time/predicate triggers |
//! | [`AsyncRetryer`] | Bounded retries with exponential backoff and jitter |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pacer::prelude::*;
//! use std::time::Duration;
//!
//! // Debounce search input: run 300ms after the last keystroke.
//! let search = Debouncer::new(
//!     |query: String| println!("searching {query}"),
//!     DebouncerOptions::default().with_wait(Duration::from_millis(300)),
//! );
//! search.maybe_execute("pacer".to_string());
//!
//! // Allow five calls per second, sliding window.
//! let limiter = RateLimiter::new(
//!     |req: u32| println!("handling {req}"),
//!     RateLimiterOptions::default()
//!         .with_limit(5)
//!         .with_window(Duration::from_secs(1))
//!         .with_window_type(WindowType::Sliding),
//! );
//! assert!(limiter.maybe_execute(1));
//! ```
//!
//! ## Virtual time
//!
//! Every timer goes through an injected [`scheduler::TimerScheduler`]. Tests
//! drive the sync primitives with [`scheduler::VirtualScheduler`] and the
//! async ones with tokio's paused clock:
//!
//! ```rust,ignore
//! use pacer::scheduler::VirtualScheduler;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(VirtualScheduler::new());
//! let d = Debouncer::new(op, DebouncerOptions::default().with_scheduler(clock.clone()));
//! d.maybe_execute(1);
//! clock.advance(Duration::from_millis(300)); // trailing edge fires here
//! ```
//!
//! ## Observability
//!
//! Each instance owns an observable state snapshot: [`subscribe`](Debouncer::subscribe)
//! for change callbacks, `get_state` for copies, and an optional
//! [`observer::Observer`] sink keyed by the `key` option for multiplexing
//! many instances into one channel.

#![warn(missing_docs)]

// Internal logging macros - no-op when tracing feature is disabled
#[cfg(feature = "tracing")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) }
}
#[cfg(not(feature = "tracing"))]
macro_rules! log_debug {
    ($($arg:tt)*) => { { let _ = ($($arg)*,); } }
}
pub(crate) use log_debug;

#[cfg(feature = "tracing")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) }
}
#[cfg(not(feature = "tracing"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { { let _ = ($($arg)*,); } }
}
pub(crate) use log_warn;

// Shared plumbing
pub mod error;
mod lock;
pub mod observer;
pub mod option;
pub mod scheduler;
pub mod state;

// Primitives
pub mod async_batcher;
pub mod async_debouncer;
pub mod async_queuer;
pub mod async_rate_limiter;
pub mod async_throttler;
pub mod batcher;
pub mod debouncer;
pub mod queuer;
pub mod rate_limiter;
pub mod retry;
pub mod throttler;

pub use async_batcher::{AsyncBatcher, AsyncBatcherOptions, AsyncBatcherState, AsyncBatcherStatus};
pub use async_debouncer::{
    AsyncDebouncer, AsyncDebouncerOptions, AsyncDebouncerState, AsyncDebouncerStatus,
};
pub use async_queuer::{
    AsyncQueuer, AsyncQueuerOptions, AsyncQueuerState, AsyncQueuerStatus, ItemReceipt,
};
pub use async_rate_limiter::{
    AsyncRateLimiter, AsyncRateLimiterOptions, AsyncRateLimiterState, AsyncRateLimiterStatus,
};
pub use async_throttler::{
    AsyncThrottler, AsyncThrottlerOptions, AsyncThrottlerState, AsyncThrottlerStatus,
};
pub use batcher::{Batcher, BatcherOptions, BatcherState, BatcherStatus, DeduplicateStrategy};
pub use debouncer::{Debouncer, DebouncerOptions, DebouncerState, DebouncerStatus};
pub use error::{PacerError, Result};
pub use observer::{NoopObserver, Observer, ObserverHandle, PrimitiveKind};
pub use option::Setting;
pub use queuer::{Position, Queuer, QueuerOptions, QueuerState, QueuerStatus};
pub use rate_limiter::{
    RateLimiter, RateLimiterOptions, RateLimiterState, RateLimiterStatus, WindowType,
};
pub use retry::{AsyncRetryer, RetryOptions, RetryerState, RetryerStatus};
pub use state::{DerivedState, StateCell, Subscription, SubscriptionId};
pub use throttler::{Throttler, ThrottlerOptions, ThrottlerState, ThrottlerStatus};

/// Commonly used items
pub mod prelude {
    pub use crate::async_batcher::{AsyncBatcher, AsyncBatcherOptions};
    pub use crate::async_debouncer::{AsyncDebouncer, AsyncDebouncerOptions};
    pub use crate::async_queuer::{AsyncQueuer, AsyncQueuerOptions};
    pub use crate::async_rate_limiter::{AsyncRateLimiter, AsyncRateLimiterOptions};
    pub use crate::async_throttler::{AsyncThrottler, AsyncThrottlerOptions};
    pub use crate::batcher::{Batcher, BatcherOptions, DeduplicateStrategy};
    pub use crate::debouncer::{Debouncer, DebouncerOptions};
    pub use crate::error::{PacerError, Result};
    pub use crate::option::Setting;
    pub use crate::queuer::{Position, Queuer, QueuerOptions};
    pub use crate::rate_limiter::{RateLimiter, RateLimiterOptions, WindowType};
    pub use crate::retry::{AsyncRetryer, RetryOptions};
    pub use crate::scheduler::{TimerScheduler, TokioScheduler, VirtualScheduler};
    pub use crate::throttler::{Throttler, ThrottlerOptions};
}
