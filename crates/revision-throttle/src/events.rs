//! Observability events emitted by the breaker.

use std::time::{Duration, Instant};
use tower_resilience_core::events::ResilienceEvent;

/// Events emitted by a [`crate::Breaker`] as it admits, rejects, and
/// completes calls, and as its capacity changes.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// A call acquired a token and is about to run.
    CallPermitted {
        /// The revision this breaker belongs to, formatted as `namespace/name`.
        pattern_name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// In-flight count immediately after this admission.
        in_flight: usize,
    },
    /// A call was rejected because the pending queue was full.
    CallRejected {
        /// The revision this breaker belongs to.
        pattern_name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// The queue depth that was exceeded.
        queue_depth: usize,
    },
    /// A queued call was cancelled before a token became available.
    CallCancelled {
        /// The revision this breaker belongs to.
        pattern_name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// How long the call waited before being cancelled.
        waited: Duration,
    },
    /// An admitted call finished and released its token.
    CallFinished {
        /// The revision this breaker belongs to.
        pattern_name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// How long the call held its token.
        duration: Duration,
    },
    /// The breaker's capacity changed.
    CapacityChanged {
        /// The revision this breaker belongs to.
        pattern_name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// Capacity before the change.
        previous: u32,
        /// Capacity after the change.
        current: u32,
    },
}

impl ResilienceEvent for BreakerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BreakerEvent::CallPermitted { .. } => "call_permitted",
            BreakerEvent::CallRejected { .. } => "call_rejected",
            BreakerEvent::CallCancelled { .. } => "call_cancelled",
            BreakerEvent::CallFinished { .. } => "call_finished",
            BreakerEvent::CapacityChanged { .. } => "capacity_changed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            BreakerEvent::CallPermitted { timestamp, .. }
            | BreakerEvent::CallRejected { timestamp, .. }
            | BreakerEvent::CallCancelled { timestamp, .. }
            | BreakerEvent::CallFinished { timestamp, .. }
            | BreakerEvent::CapacityChanged { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            BreakerEvent::CallPermitted { pattern_name, .. }
            | BreakerEvent::CallRejected { pattern_name, .. }
            | BreakerEvent::CallCancelled { pattern_name, .. }
            | BreakerEvent::CallFinished { pattern_name, .. }
            | BreakerEvent::CapacityChanged { pattern_name, .. } => pattern_name,
        }
    }
}
