//! Core infrastructure shared by `revision-throttle`.
//!
//! The only piece carried over from the wider tower-resilience pattern
//! family is the event system: a pattern-agnostic listener registry that
//! admission primitives emit observability events through, optionally
//! wired up to `tracing` and `metrics`.

pub mod events;

pub use events::{EventListener, ResilienceEvent};
