//! The process-wide collection of per-revision breakers.

use crate::breaker::{Breaker, BreakerParams};
use crate::capacity::compute_capacity;
use crate::error::{LookupError, ThrottleResult};
use crate::events::BreakerEvent;
use crate::revision::{Revision, RevisionID};
use futures::future::BoxFuture;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tower_resilience_core::events::{EventListeners, FnListener};

/// Looks up the current ready-endpoint count for a revision.
pub trait EndpointsLookup: Send + Sync {
    /// Returns the number of ready endpoints backing `rev_id`.
    fn get_endpoints<'a>(&'a self, rev_id: &'a RevisionID) -> BoxFuture<'a, Result<u32, LookupError>>;
}

impl<F> EndpointsLookup for F
where
    F: Fn(&RevisionID) -> BoxFuture<'_, Result<u32, LookupError>> + Send + Sync,
{
    fn get_endpoints<'a>(&'a self, rev_id: &'a RevisionID) -> BoxFuture<'a, Result<u32, LookupError>> {
        self(rev_id)
    }
}

/// Looks up the revision fields the core reads.
pub trait RevisionLookup: Send + Sync {
    /// Returns the current revision view for `rev_id`.
    fn get_revision<'a>(&'a self, rev_id: &'a RevisionID) -> BoxFuture<'a, Result<Revision, LookupError>>;
}

impl<F> RevisionLookup for F
where
    F: Fn(&RevisionID) -> BoxFuture<'_, Result<Revision, LookupError>> + Send + Sync,
{
    fn get_revision<'a>(&'a self, rev_id: &'a RevisionID) -> BoxFuture<'a, Result<Revision, LookupError>> {
        self(rev_id)
    }
}

/// Configuration for a [`Throttle`].
pub struct ThrottleConfig {
    pub(crate) params: BreakerParams,
    pub(crate) max_concurrency: u32,
    pub(crate) get_endpoints: Arc<dyn EndpointsLookup>,
    pub(crate) get_revision: Arc<dyn RevisionLookup>,
    pub(crate) event_listeners: EventListeners<BreakerEvent>,
}

impl ThrottleConfig {
    /// Creates a new configuration builder.
    ///
    /// `get_endpoints` and `get_revision` are the two collaborator
    /// callbacks the miss-path and update-path capacity refresh invoke.
    pub fn builder<GE, GR>(params: BreakerParams, get_endpoints: GE, get_revision: GR) -> ThrottleConfigBuilder
    where
        GE: EndpointsLookup + 'static,
        GR: RevisionLookup + 'static,
    {
        ThrottleConfigBuilder {
            params,
            get_endpoints: Arc::new(get_endpoints),
            get_revision: Arc::new(get_revision),
            event_listeners: EventListeners::new(),
        }
    }
}

/// Builder for [`ThrottleConfig`].
pub struct ThrottleConfigBuilder {
    params: BreakerParams,
    get_endpoints: Arc<dyn EndpointsLookup>,
    get_revision: Arc<dyn RevisionLookup>,
    event_listeners: EventListeners<BreakerEvent>,
}

impl ThrottleConfigBuilder {
    /// Registers a callback invoked whenever a call is permitted by any
    /// revision's breaker.
    pub fn on_call_permitted<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let BreakerEvent::CallPermitted {
                pattern_name,
                in_flight,
                ..
            } = event
            {
                f(pattern_name, *in_flight);
            }
        }));
        self
    }

    /// Registers a callback invoked whenever a call is rejected by any
    /// revision's breaker because its queue is full.
    pub fn on_call_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let BreakerEvent::CallRejected {
                pattern_name,
                queue_depth,
                ..
            } = event
            {
                f(pattern_name, *queue_depth);
            }
        }));
        self
    }

    /// Registers a callback invoked whenever a revision's capacity changes.
    pub fn on_capacity_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, u32, u32) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let BreakerEvent::CapacityChanged {
                pattern_name,
                previous,
                current,
                ..
            } = event
            {
                f(pattern_name, *previous, *current);
            }
        }));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrency: self.params.max_concurrency,
            params: self.params,
            get_endpoints: self.get_endpoints,
            get_revision: self.get_revision,
            event_listeners: self.event_listeners,
        }
    }
}

/// A point-in-time read of a single revision's breaker state.
///
/// Exposed for tests and observability; carries no behavioural weight of
/// its own, the same kind of read-only introspection `limit()`/
/// `in_flight()` accessors provide elsewhere in this crate family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// The breaker's current admission budget.
    pub capacity: u32,
    /// Calls currently admitted and running.
    pub in_flight: usize,
    /// Callers currently waiting for a token.
    pub pending: usize,
}

/// The process-wide collection of breakers, keyed by revision identity.
///
/// Breakers are created lazily on first reference, either from the request
/// path ([`Throttle::try_call`]) or the endpoint-change path
/// ([`Throttle::update_capacity`]), and are removed only by an explicit
/// [`Throttle::remove`]. The map itself is guarded by a short-held
/// [`parking_lot::Mutex`]; breaker operations never run while that lock is
/// held, so the map lock and a breaker's internal synchronisation never
/// nest in either order.
pub struct Throttle {
    breakers: Mutex<HashMap<RevisionID, Arc<Breaker>>>,
    config: Arc<ThrottleConfig>,
}

impl Throttle {
    /// Creates a new, empty throttle.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Looks up the breaker for `rev_id`, creating one at
    /// [`BreakerParams::initial_capacity`] if none exists.
    ///
    /// Returns the breaker together with whether it was just created by
    /// this call, so callers can decide whether to trigger a miss-path
    /// capacity refresh. The map lock is held only for the duration of the
    /// lookup-or-insert.
    fn lookup_or_create(&self, rev_id: &RevisionID) -> (Arc<Breaker>, bool) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(rev_id) {
            return (Arc::clone(breaker), false);
        }

        let breaker = Arc::new(Breaker::with_listeners(
            rev_id.to_string(),
            self.config.params,
            self.config.event_listeners.clone(),
        ));
        breakers.insert(rev_id.clone(), Arc::clone(&breaker));
        (breaker, true)
    }

    /// Entry point for the request path.
    ///
    /// Looks up (creating if necessary) the breaker for `rev_id`. If the
    /// breaker was just created, synchronously refreshes its capacity from
    /// `get_endpoints`/`get_revision` before attempting admission. Then
    /// runs `f` under the breaker's admission control.
    pub async fn try_call<F, Fut, T>(&self, rev_id: &RevisionID, f: F) -> ThrottleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (breaker, just_created) = self.lookup_or_create(rev_id);

        if just_created {
            self.refresh_capacity(rev_id, &breaker).await?;
        }

        Ok(breaker.try_call(f).await?)
    }

    /// Same entry point as [`Self::try_call`], but gives up with
    /// [`ThrottleError::Breaker`]`(`[`crate::error::BreakerError::Cancelled`]`)`
    /// if `duration` elapses while the call is still queued on the
    /// revision's breaker.
    pub async fn try_call_with_timeout<F, Fut, T>(
        &self,
        rev_id: &RevisionID,
        duration: std::time::Duration,
        f: F,
    ) -> ThrottleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (breaker, just_created) = self.lookup_or_create(rev_id);

        if just_created {
            self.refresh_capacity(rev_id, &breaker).await?;
        }

        Ok(breaker.try_call_with_timeout(duration, f).await?)
    }

    /// Entry point for the endpoint-change path.
    ///
    /// Calls `get_revision` first; if it fails, returns the error without
    /// ever creating a breaker for `rev_id`. Only once it succeeds does this
    /// look up (creating if necessary) the breaker, compute the effective
    /// capacity from `ready_endpoints` and the revision's
    /// `ContainerConcurrency`, and apply it.
    ///
    /// Callers must not invoke this concurrently for the same `rev_id`;
    /// the informer that sources endpoint events is expected to serialise
    /// per-revision events. Calls for distinct revisions may run
    /// concurrently.
    pub async fn update_capacity(&self, rev_id: &RevisionID, ready_endpoints: u32) -> ThrottleResult<()> {
        let revision = self.config.get_revision.get_revision(rev_id).await?;
        let (breaker, _) = self.lookup_or_create(rev_id);
        let capacity = compute_capacity(
            revision.container_concurrency,
            ready_endpoints,
            self.config.max_concurrency,
        );
        breaker.update_concurrency(capacity)?;
        Ok(())
    }

    /// Removes the breaker for `rev_id`, if any.
    ///
    /// Already-admitted in-flight work on the removed breaker continues to
    /// completion; a subsequent [`Throttle::try_call`] for the same
    /// `rev_id` creates a fresh breaker at `InitialCapacity` and triggers a
    /// new miss-path refresh.
    pub fn remove(&self, rev_id: &RevisionID) {
        self.breakers.lock().remove(rev_id);
    }

    /// Returns a capacity/in-flight/pending snapshot for `rev_id`, if a
    /// breaker currently exists for it. For tests and observability only;
    /// not part of the request or control path.
    pub fn breaker_snapshot(&self, rev_id: &RevisionID) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.lock().get(rev_id).cloned()?;
        Some(BreakerSnapshot {
            capacity: breaker.capacity(),
            in_flight: breaker.in_flight(),
            pending: breaker.pending(),
        })
    }

    async fn refresh_capacity(&self, rev_id: &RevisionID, breaker: &Breaker) -> ThrottleResult<()> {
        let ready_endpoints = self.config.get_endpoints.get_endpoints(rev_id).await?;
        let revision = self.config.get_revision.get_revision(rev_id).await?;
        let capacity = compute_capacity(
            revision.container_concurrency,
            ready_endpoints,
            self.config.max_concurrency,
        );
        breaker.update_concurrency(capacity)?;
        Ok(())
    }
}
