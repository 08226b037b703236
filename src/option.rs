//! Value-or-function option fields
//!
//! Several option fields accept either a plain value or a function of the
//! primitive's current state, re-resolved at every use. Resolution is never
//! cached: a dynamic `wait` may legitimately depend on mutable counters.
//!
//! # Example
//!
//! ```rust,ignore
//! use pacer::{Setting, DebouncerState};
//! use std::time::Duration;
//!
//! // Fixed value
//! let wait: Setting<Duration, DebouncerState> = Duration::from_millis(300).into();
//!
//! // Back off as executions accumulate
//! let wait = Setting::from_fn(|state: &DebouncerState| {
//!     Duration::from_millis(100 * (1 + state.execution_count as u64))
//! });
//! ```

use std::fmt;
use std::sync::Arc;

/// An option field holding either a fixed value or a function of the
/// current state snapshot.
pub enum Setting<T, S> {
    /// A plain value
    Fixed(T),
    /// Resolved against the current state at each use
    Dynamic(Arc<dyn Fn(&S) -> T + Send + Sync>),
}

impl<T: Clone, S> Setting<T, S> {
    /// Build the dynamic form from a resolver function
    pub fn from_fn(f: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(f))
    }

    /// Resolve the field against the current state
    pub fn resolve(&self, state: &S) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Dynamic(f) => f(state),
        }
    }
}

impl<T, S> From<T> for Setting<T, S> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}

impl<T: Clone, S> Clone for Setting<T, S> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(value) => Self::Fixed(value.clone()),
            Self::Dynamic(f) => Self::Dynamic(f.clone()),
        }
    }
}

impl<T: fmt::Debug, S> fmt::Debug for Setting<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_resolves_to_value() {
        let setting: Setting<u32, ()> = 7.into();
        assert_eq!(setting.resolve(&()), 7);
    }

    #[test]
    fn test_dynamic_resolves_against_state() {
        let setting: Setting<usize, Vec<u8>> = Setting::from_fn(|s: &Vec<u8>| s.len() * 2);
        assert_eq!(setting.resolve(&vec![1, 2, 3]), 6);
    }

    #[test]
    fn test_dynamic_is_not_cached() {
        let setting: Setting<usize, Vec<u8>> = Setting::from_fn(|s: &Vec<u8>| s.len());
        assert_eq!(setting.resolve(&vec![1]), 1);
        assert_eq!(setting.resolve(&vec![1, 2]), 2);
    }
}
