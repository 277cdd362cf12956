//! Translates endpoint-informer events into throttle map operations.
//!
//! These adapters are thin, but they define the ordering contract between
//! endpoint observations and request admission: the sequence of
//! [`Throttle::update_capacity`]/[`Throttle::remove`] calls they produce
//! for a given revision must match the sequence of add/update/delete
//! events the informer observed for that revision. The informer is
//! expected to serialise events per revision; breaching that contract can
//! strand a breaker at a stale capacity.

use crate::revision::RevisionID;
use crate::throttle::Throttle;

/// One subset of an endpoints object: a count of ready backing addresses.
///
/// The original Kubernetes `EndpointSubset` also carries not-ready
/// addresses and per-port information; the throttle core only ever reads
/// the ready count, so that is all this adapter models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointsSubset {
    /// Number of addresses in this subset considered ready.
    pub ready_addresses: u32,
}

/// The payload an endpoints-informer callback observes: enough to derive a
/// [`RevisionID`] and a ready-endpoint count.
#[derive(Debug, Clone)]
pub struct EndpointsEvent {
    /// The Kubernetes namespace of the endpoints object.
    pub namespace: String,
    /// The Kubernetes name of the endpoints object.
    pub name: String,
    /// The subsets reported by this endpoints object.
    pub subsets: Vec<EndpointsSubset>,
}

impl EndpointsEvent {
    /// Creates a new endpoints event.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, subsets: Vec<EndpointsSubset>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            subsets,
        }
    }

    /// Sums ready addresses across all subsets.
    pub fn ready_count(&self) -> u32 {
        self.subsets.iter().map(|s| s.ready_addresses).sum()
    }
}

/// Maps an endpoints object's name to the revision name it backs.
///
/// This mapping is external to the core (it depends on naming conventions
/// owned by the collaborator that creates endpoints objects); the adapter
/// only consumes it through this trait.
pub trait RevisionNameResolver: Send + Sync {
    /// Returns the revision name backed by the endpoints object named
    /// `endpoints_name`.
    fn revision_name_for(&self, endpoints_name: &str) -> String;
}

impl<F> RevisionNameResolver for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn revision_name_for(&self, endpoints_name: &str) -> String {
        self(endpoints_name)
    }
}

/// Adapts endpoints-informer callbacks onto a [`Throttle`].
pub struct EndpointsAdapter<R> {
    throttle: std::sync::Arc<Throttle>,
    resolver: R,
}

impl<R> EndpointsAdapter<R>
where
    R: RevisionNameResolver,
{
    /// Creates a new adapter over `throttle`, resolving revision names via
    /// `resolver`.
    pub fn new(throttle: std::sync::Arc<Throttle>, resolver: R) -> Self {
        Self { throttle, resolver }
    }

    /// Handles an endpoints add/update event.
    ///
    /// Computes the ready-endpoint count as the sum of ready addresses
    /// across subsets and calls [`Throttle::update_capacity`]. A lookup or
    /// breaker failure is logged (via the `tracing` feature, when enabled)
    /// and swallowed: the informer has no retry surface of its own, so
    /// nothing is gained by propagating the error back to it.
    pub async fn on_upsert(&self, event: &EndpointsEvent) {
        let rev_id = self.revision_id(event);
        let ready = event.ready_count();
        if let Err(_err) = self.throttle.update_capacity(&rev_id, ready).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(revision = %rev_id, error = %_err, "endpoints upsert failed to update throttle capacity");
        }
    }

    /// Handles an endpoints delete event.
    ///
    /// Derives the same [`RevisionID`] as [`Self::on_upsert`] would and
    /// removes its breaker.
    pub fn on_delete(&self, event: &EndpointsEvent) {
        let rev_id = self.revision_id(event);
        self.throttle.remove(&rev_id);
    }

    fn revision_id(&self, event: &EndpointsEvent) -> RevisionID {
        let revision_name = self.resolver.revision_name_for(&event.name);
        RevisionID::new(event.namespace.clone(), revision_name)
    }
}
