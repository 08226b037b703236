//! Crate error types
//!
//! User operations in the async variants fail with [`anyhow::Error`]; the
//! crate wraps them in an `Arc` so one settled result can be handed to every
//! caller awaiting it.

use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by pacing primitives.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PacerError {
    /// The user operation returned an error
    #[error("{0}")]
    Operation(Arc<anyhow::Error>),

    /// Execution was aborted before completion
    #[error("execution aborted")]
    Aborted,

    /// The rate limiter rejected the call
    #[error("rate limit exceeded, retry in {retry_in:?}")]
    RateLimited {
        /// Time until the current window frees capacity
        retry_in: Duration,
    },

    /// The queue is at capacity
    #[error("queue is full (max size {max_size})")]
    QueueFull {
        /// Configured capacity
        max_size: usize,
    },
}

impl PacerError {
    /// Wrap a user-operation error
    pub fn operation(err: anyhow::Error) -> Self {
        Self::Operation(Arc::new(err))
    }

    /// True if this is an abort, not a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Result alias used across the crate
pub type Result<T, E = PacerError> = std::result::Result<T, E>;
