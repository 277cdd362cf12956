//! Per-revision concurrency throttle for a serverless-on-Kubernetes
//! activator.
//!
//! This crate implements the core admission-control primitive that sits on
//! the request path for revisions whose backing pods may be scaled to
//! zero or mid-scale-up: a process-wide [`Throttle`] map of per-revision
//! [`Breaker`]s, each enforcing a concurrency budget derived from the
//! revision's configured per-container concurrency and its current
//! ready-endpoint count.
//!
//! The HTTP ingress, the upstream proxy that performs the actual
//! connection to a chosen endpoint, and the Kubernetes informer machinery
//! are all external collaborators; this crate only specifies the
//! interfaces it consumes from and exposes to them.
//!
//! # Basic Example
//!
//! ```rust
//! use revision_throttle::{BreakerParams, RevisionID, Revision, ThrottleConfig, Throttle};
//! use futures::future::BoxFuture;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let params = BreakerParams::builder()
//!     .queue_depth(100)
//!     .max_concurrency(1000)
//!     .initial_capacity(0)
//!     .build();
//!
//! let get_endpoints = |_rev_id: &RevisionID| -> BoxFuture<'_, Result<u32, revision_throttle::LookupError>> {
//!     Box::pin(async { Ok(3) })
//! };
//! let get_revision = |_rev_id: &RevisionID| -> BoxFuture<'_, Result<Revision, revision_throttle::LookupError>> {
//!     Box::pin(async { Ok(Revision::new(4)) })
//! };
//!
//! let throttle = Throttle::new(
//!     ThrottleConfig::builder(params, get_endpoints, get_revision).build(),
//! );
//!
//! let rev_id = RevisionID::new("default", "my-revision");
//! let result = throttle
//!     .try_call(&rev_id, || async { "forwarded to an endpoint" })
//!     .await;
//! # let _ = result;
//! # }
//! ```
//!
//! # Example with Event Listeners
//!
//! ```rust
//! use revision_throttle::{BreakerParams, RevisionID, Revision, ThrottleConfig};
//! use futures::future::BoxFuture;
//!
//! # fn example() {
//! let params = BreakerParams::builder().max_concurrency(100).build();
//! let get_endpoints = |_: &RevisionID| -> BoxFuture<'_, Result<u32, revision_throttle::LookupError>> {
//!     Box::pin(async { Ok(0) })
//! };
//! let get_revision = |_: &RevisionID| -> BoxFuture<'_, Result<Revision, revision_throttle::LookupError>> {
//!     Box::pin(async { Ok(Revision::new(0)) })
//! };
//!
//! let _config = ThrottleConfig::builder(params, get_endpoints, get_revision)
//!     .on_call_rejected(|revision, queue_depth| {
//!         println!("{revision} rejected a call at queue depth {queue_depth}");
//!     })
//!     .on_capacity_changed(|revision, previous, current| {
//!         println!("{revision} capacity {previous} -> {current}");
//!     })
//!     .build();
//! # }
//! ```

pub mod adapter;
pub mod breaker;
pub mod capacity;
pub mod error;
pub mod events;
pub mod revision;
pub mod throttle;

pub use adapter::{EndpointsAdapter, EndpointsEvent, EndpointsSubset, RevisionNameResolver};
pub use breaker::{Breaker, BreakerParams, BreakerParamsBuilder};
pub use capacity::compute_capacity;
pub use error::{BreakerError, BreakerResult, LookupError, ThrottleError, ThrottleResult};
pub use events::BreakerEvent;
pub use revision::{Revision, RevisionID};
pub use throttle::{
    BreakerSnapshot, EndpointsLookup, RevisionLookup, Throttle, ThrottleConfig, ThrottleConfigBuilder,
};
