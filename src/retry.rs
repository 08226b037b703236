//! AsyncRetryer: bounded retries with exponential backoff
//!
//! Invokes an async operation up to `max_attempts` times, sleeping between
//! attempts along an exponential backoff schedule with optional jitter. A
//! [`CancellationToken`] is handed to every attempt; [`abort`](AsyncRetryer::abort)
//! cancels the outstanding attempt and schedules no further retries.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{AsyncRetryer, RetryOptions};
//! use std::time::Duration;
//!
//! let retryer = AsyncRetryer::new(
//!     RetryOptions::default()
//!         .with_max_attempts(5)
//!         .with_initial_delay(Duration::from_millis(200)),
//! );
//!
//! let body = retryer
//!     .execute(|_token| async move { fetch("https://example.com").await })
//!     .await?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::PacerError;
use crate::lock::lock_or_recover;
use crate::observer::{ObserverHandle, PrimitiveKind};
use crate::scheduler::{self, TimerScheduler, TokioScheduler};
use crate::state::{DerivedState, StateCell, Subscription};

/// Execution status of a retryer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RetryerStatus {
    /// No execution in flight
    #[default]
    Idle,
    /// An attempt is running or a backoff delay is pending
    Executing,
}

/// Read-only retryer state snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryerState {
    /// Attempt number of the current (or last) execution, 1-based
    pub attempts: usize,
    /// Whether an execution is in flight
    pub is_executing: bool,
    /// Executions that eventually succeeded
    pub success_count: usize,
    /// Individual attempts that failed
    pub error_count: usize,
    /// Derived status
    pub status: RetryerStatus,
}

impl DerivedState for RetryerState {
    fn recompute(&mut self) {
        self.status = if self.is_executing {
            RetryerStatus::Executing
        } else {
            RetryerStatus::Idle
        };
    }
}

/// Retry configuration
#[derive(Clone)]
pub struct RetryOptions {
    /// Total attempts, the first one included
    pub max_attempts: usize,
    /// Backoff before the second attempt
    pub initial_delay: Duration,
    /// Backoff growth factor per attempt
    pub multiplier: f64,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Fraction of each delay randomized away, in `[0, 1]`; 0 is deterministic
    pub jitter: f64,
    /// Veto retries per error; defaults to retrying every error
    pub should_retry: Option<Arc<dyn Fn(&anyhow::Error, usize) -> bool + Send + Sync>>,
    /// Called with the attempt number before each backoff delay
    pub on_retry: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    /// Identifier for observer multiplexing
    pub key: Option<String>,
    /// Called with the fresh snapshot after each published change
    pub on_state_change: Option<Arc<dyn Fn(&RetryerState) + Send + Sync>>,
    /// Change-notification sink
    pub observer: Option<ObserverHandle>,
    /// Timer source for backoff delays; defaults to a [`TokioScheduler`]
    pub scheduler: Option<Arc<dyn TimerScheduler>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
            should_retry: None,
            on_retry: None,
            key: None,
            on_state_change: None,
            observer: None,
            scheduler: None,
        }
    }
}

impl RetryOptions {
    /// One attempt, no retries; what the other async primitives embed by
    /// default
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first backoff delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Cap the backoff delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Randomize each delay by up to this fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Veto retries per error
    pub fn with_should_retry(
        mut self,
        f: impl Fn(&anyhow::Error, usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(f));
        self
    }

    /// Called before each backoff delay
    pub fn with_on_retry(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
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
        f: impl Fn(&RetryerState) + Send + Sync + 'static,
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

    /// Backoff before attempt `attempt + 1`, jitter applied
    pub(crate) fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let scale = if self.jitter > 0.0 {
            1.0 - self.jitter * rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * scale)
    }
}

struct RetryerInner {
    options: Mutex<RetryOptions>,
    scheduler: Arc<dyn TimerScheduler>,
    state: StateCell<RetryerState>,
    /// Serializes executions; concurrent callers queue up
    exec_gate: tokio::sync::Mutex<()>,
    current: Mutex<Option<CancellationToken>>,
}

/// Invokes an async operation with bounded retries and backoff.
///
/// Executions are serial per retryer: a second `execute` waits for the
/// first to settle. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct AsyncRetryer {
    inner: Arc<RetryerInner>,
}

impl AsyncRetryer {
    /// Create a retryer
    pub fn new(options: RetryOptions) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn TimerScheduler>);
        Self {
            inner: Arc::new(RetryerInner {
                options: Mutex::new(options),
                scheduler,
                state: StateCell::new(RetryerState::default()),
                exec_gate: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
            }),
        }
    }

    /// Run `op` with retries. Each attempt receives a fresh cancellation
    /// token; [`abort`](Self::abort) cancels the outstanding attempt and
    /// surfaces [`PacerError::Aborted`].
    pub async fn execute<R, Op, Fut>(&self, op: Op) -> Result<R, PacerError>
    where
        Op: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let _gate = self.inner.exec_gate.lock().await;
        let max_attempts = lock_or_recover(&self.inner.options).max_attempts;
        self.inner.state.update(|s| {
            s.is_executing = true;
            s.attempts = 0;
        });
        self.inner.publish();

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            self.inner.state.update(|s| s.attempts = attempt);

            let token = CancellationToken::new();
            *lock_or_recover(&self.inner.current) = Some(token.clone());

            let outcome = tokio::select! {
                outcome = op(token.clone()) => outcome,
                _ = token.cancelled() => {
                    break Err(PacerError::Aborted);
                }
            };

            match outcome {
                Ok(value) => {
                    self.inner.state.update(|s| s.success_count += 1);
                    break Ok(value);
                }
                Err(error) => {
                    self.inner.state.update(|s| s.error_count += 1);
                    let (should_retry, on_retry) = {
                        let options = lock_or_recover(&self.inner.options);
                        let wants_retry = attempt < max_attempts
                            && options
                                .should_retry
                                .as_ref()
                                .map_or(true, |f| f(&error, attempt));
                        (wants_retry, options.on_retry.clone())
                    };
                    if !should_retry {
                        break Err(PacerError::operation(error));
                    }

                    log_debug!("retrying after failed attempt {}", attempt);
                    if let Some(f) = on_retry {
                        f(attempt);
                    }
                    self.inner.publish();

                    let delay = lock_or_recover(&self.inner.options).delay_for_attempt(attempt);
                    tokio::select! {
                        _ = scheduler::sleep(&self.inner.scheduler, delay) => {}
                        _ = token.cancelled() => {
                            break Err(PacerError::Aborted);
                        }
                    }
                }
            }
        };

        *lock_or_recover(&self.inner.current) = None;
        self.inner.state.update(|s| s.is_executing = false);
        self.inner.publish();
        result
    }

    /// Cancel the outstanding attempt; no further retries are scheduled
    pub fn abort(&self) {
        if let Some(token) = lock_or_recover(&self.inner.current).take() {
            token.cancel();
        }
    }

    /// Reset counters and attempt tracking
    pub fn reset(&self) {
        self.abort();
        self.inner.state.replace(RetryerState::default());
        self.inner.publish();
    }

    /// Mutate the options; takes effect on the next execution
    pub fn set_options(&self, f: impl FnOnce(&mut RetryOptions)) {
        f(&mut lock_or_recover(&self.inner.options));
        self.inner.publish();
    }

    /// Current state snapshot
    pub fn get_state(&self) -> RetryerState {
        self.inner.state.get()
    }

    /// Register a change callback
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe(f)
    }

    /// Whether an execution is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.with(|s| s.is_executing)
    }
}

impl RetryerInner {
    fn publish(&self) {
        self.state.notify();
        let (on_change, observer, key) = {
            let options = lock_or_recover(&self.options);
            (
                options.on_state_change.clone(),
                options.observer.clone(),
                options.key.clone(),
            )
        };
        if let Some(f) = on_change {
            f(&self.state.get());
        }
        if let Some(observer) = observer {
            observer.state_changed(PrimitiveKind::AsyncRetryer, key.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let options = RetryOptions::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(350));

        assert_eq!(options.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(options.delay_for_attempt(2), Duration::from_millis(200));
        // capped by max_delay
        assert_eq!(options.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let options = RetryOptions::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.5);
        for _ in 0..32 {
            let d = options.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let retryer = AsyncRetryer::new(
            RetryOptions::default()
                .with_max_attempts(4)
                .with_initial_delay(Duration::from_millis(10)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let result = retryer
            .execute(move |_token| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient")
                    }
                    Ok(99)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = retryer.get_state();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.error_count, 2);
        assert_eq!(state.success_count, 1);
        assert!(!state.is_executing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_surface_last_error() {
        let retryer = AsyncRetryer::new(
            RetryOptions::default()
                .with_max_attempts(2)
                .with_initial_delay(Duration::from_millis(10)),
        );

        let result: Result<(), _> = retryer
            .execute(|_token| async { anyhow::bail!("always down") })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "always down");
        assert_eq!(retryer.get_state().error_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_retry_veto() {
        let retryer = AsyncRetryer::new(
            RetryOptions::default()
                .with_max_attempts(5)
                .with_should_retry(|error, _attempt| !error.to_string().contains("fatal")),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let result: Result<(), _> = retryer
            .execute(move |_token| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("fatal: no point")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_backoff() {
        let retryer = AsyncRetryer::new(
            RetryOptions::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_secs(60)),
        );

        let handle = {
            let retryer = retryer.clone();
            tokio::spawn(async move {
                let result: Result<(), PacerError> = retryer
                    .execute(|_token| async { anyhow::bail!("down") })
                    .await;
                result
            })
        };

        // let the first attempt fail and the backoff start
        tokio::time::sleep(Duration::from_millis(10)).await;
        retryer.abort();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PacerError::Aborted)));
    }
}
