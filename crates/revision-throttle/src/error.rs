//! Error types for the breaker and throttle map.

use std::fmt;
use std::sync::Arc;

/// Errors that can occur when admitting a call through a [`crate::Breaker`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerError {
    /// The breaker rejected the call because its pending queue is full.
    #[error("breaker is full: queue depth ({queue_depth}) reached")]
    Overload {
        /// Maximum number of callers allowed to wait for a token.
        queue_depth: usize,
    },
    /// The caller's cancellation signal fired while the call was queued.
    #[error("call cancelled while waiting for a breaker token")]
    Cancelled,
    /// Attempted to set a capacity outside `[0, max_concurrency]`.
    #[error("invalid capacity: requested {requested}, max {max}")]
    InvalidCapacity {
        /// The capacity that was requested.
        requested: u32,
        /// The configured upper bound.
        max: u32,
    },
}

/// Result type for breaker operations.
pub type BreakerResult<T> = std::result::Result<T, BreakerError>;

/// An opaque error surfaced by a collaborator lookup (`getEndpoints` or
/// `getRevision`).
///
/// Wrapped in an `Arc` so it can be cheaply cloned into error paths
/// without this crate inventing a concrete error type for collaborators
/// it does not own.
#[derive(Debug, Clone)]
pub struct LookupError(Arc<dyn std::error::Error + Send + Sync>);

impl LookupError {
    /// Wraps any error as a lookup failure.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Errors returned from the throttle map's request-path and control-path
/// entry points.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThrottleError {
    /// The revision's breaker rejected or cancelled the call.
    #[error(transparent)]
    Breaker(#[from] BreakerError),
    /// `getEndpoints` or `getRevision` failed while refreshing capacity.
    #[error("capacity lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// Result type for throttle map operations.
pub type ThrottleResult<T> = std::result::Result<T, ThrottleError>;
