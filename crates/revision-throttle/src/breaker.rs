//! The bounded-concurrency admission primitive for a single revision.

use crate::error::{BreakerError, BreakerResult};
use crate::events::BreakerEvent;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tower_resilience_core::events::EventListeners;

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Configuration captured once when a [`Breaker`] is created.
#[derive(Debug, Clone, Copy)]
pub struct BreakerParams {
    /// Maximum number of callers that may simultaneously wait for a token.
    pub(crate) queue_depth: usize,
    /// Upper bound on this breaker's capacity.
    pub(crate) max_concurrency: u32,
    /// Starting capacity.
    pub(crate) initial_capacity: u32,
}

impl BreakerParams {
    /// Creates a new builder for breaker parameters.
    pub fn builder() -> BreakerParamsBuilder {
        BreakerParamsBuilder::new()
    }
}

/// Builder for [`BreakerParams`].
pub struct BreakerParamsBuilder {
    queue_depth: usize,
    max_concurrency: u32,
    initial_capacity: u32,
}

impl BreakerParamsBuilder {
    fn new() -> Self {
        Self {
            queue_depth: 100,
            max_concurrency: 100,
            initial_capacity: 0,
        }
    }

    /// Sets the maximum number of callers allowed to wait for a token.
    ///
    /// Default: 100
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Sets the upper bound on this breaker's capacity.
    ///
    /// Default: 100
    pub fn max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the starting capacity of a freshly created breaker.
    ///
    /// Default: 0
    pub fn initial_capacity(mut self, initial: u32) -> Self {
        self.initial_capacity = initial;
        self
    }

    /// Builds the parameters.
    pub fn build(self) -> BreakerParams {
        BreakerParams {
            queue_depth: self.queue_depth,
            max_concurrency: self.max_concurrency,
            initial_capacity: self.initial_capacity,
        }
    }
}

impl Default for BreakerParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements a breaker's pending-waiter count exactly once when dropped,
/// whether that happens because the wait settled normally or because the
/// caller's future was dropped (cancelled) while still queued.
struct PendingGuard<'a> {
    pending: &'a AtomicUsize,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a AtomicUsize) -> Self {
        Self { pending }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Decrements a breaker's in-flight count and releases its permit exactly
/// once when dropped, whether that happens because `f` returned normally or
/// because the future running it was dropped (task abort, a losing
/// `select!` branch) or unwound from a panic while still polling `f`. Both
/// the in-flight counter and the permit must go back through this path
/// rather than the permit's own `Drop`, so that outstanding `shrink_debt`
/// is still paid down on a non-normal exit.
struct PermitGuard<'a> {
    breaker: &'a Breaker,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl<'a> PermitGuard<'a> {
    fn new(breaker: &'a Breaker, permit: tokio::sync::OwnedSemaphorePermit) -> Self {
        Self {
            breaker,
            permit: Some(permit),
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.breaker.release_permit(permit);
        }
    }
}

/// A bounded-concurrency admission primitive with a bounded waiting queue.
///
/// The breaker admits at most `capacity()` concurrent executions of caller
/// functions, queues callers beyond that up to `queue_depth`, and rejects
/// callers synchronously once the queue is full. Capacity can be changed at
/// any time, including down to zero, without interrupting admitted work.
///
/// Concurrency budget is modelled as a [`tokio::sync::Semaphore`] whose
/// permit count tracks the current capacity. Raising capacity adds permits.
/// Lowering capacity cannot revoke permits already handed to in-flight
/// work, so the breaker instead commits to *not returning* that many
/// permits as in-flight work finishes: permits that are forgotten
/// immediately (because they happen to be idle) shrink capacity at once;
/// the remainder is tracked as `shrink_debt` and paid down opportunistically
/// as outstanding permits complete.
pub struct Breaker {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: AtomicU32,
    shrink_debt: AtomicU32,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    params: BreakerParams,
    event_listeners: EventListeners<BreakerEvent>,
}

impl Breaker {
    /// Creates a new breaker at `params.initial_capacity`.
    pub fn new(name: impl Into<String>, params: BreakerParams) -> Self {
        Self::with_listeners(name, params, EventListeners::new())
    }

    pub(crate) fn with_listeners(
        name: impl Into<String>,
        params: BreakerParams,
        event_listeners: EventListeners<BreakerEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(params.initial_capacity as usize)),
            capacity: AtomicU32::new(params.initial_capacity),
            shrink_debt: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            params,
            event_listeners,
        }
    }

    /// The breaker's current admission budget.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// The number of callers currently waiting for a token.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// The number of calls currently admitted and running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The configuration this breaker was created with.
    pub fn params(&self) -> BreakerParams {
        self.params
    }

    /// Attempts to run `f` under a token.
    ///
    /// Rejects synchronously with [`BreakerError::Overload`] if the pending
    /// queue is already full. Otherwise waits (FIFO among waiters) for a
    /// token, runs the future produced by `f`, and releases the token on
    /// every exit path, including the future being dropped before it
    /// completes.
    pub async fn try_call<F, Fut, T>(&self, f: F) -> BreakerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire_permit(None).await?;
        Ok(self.run_with_permit(permit, f).await)
    }

    /// Attempts to run `f` under a token, giving up with
    /// [`BreakerError::Cancelled`] if `duration` elapses while still
    /// queued.
    ///
    /// Identical to [`Self::try_call`] otherwise: still rejects
    /// synchronously with [`BreakerError::Overload`] if the pending queue
    /// is already full, and still runs `f` to completion once a token is
    /// acquired, with no further timeout applied to `f` itself.
    pub async fn try_call_with_timeout<F, Fut, T>(&self, duration: Duration, f: F) -> BreakerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire_permit(Some(duration)).await?;
        Ok(self.run_with_permit(permit, f).await)
    }

    /// Claims a pending-queue slot and waits for a token, optionally bounded
    /// by `wait_bound`. Returns [`BreakerError::Overload`] if the queue is
    /// already full, or [`BreakerError::Cancelled`] if `wait_bound` elapses
    /// first.
    async fn acquire_permit(
        &self,
        wait_bound: Option<Duration>,
    ) -> BreakerResult<tokio::sync::OwnedSemaphorePermit> {
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                if p >= self.params.queue_depth {
                    None
                } else {
                    Some(p + 1)
                }
            })
            .is_err()
        {
            let event = BreakerEvent::CallRejected {
                pattern_name: self.name.clone(),
                timestamp: Instant::now(),
                queue_depth: self.params.queue_depth,
            };
            self.event_listeners.emit(&event);

            #[cfg(feature = "metrics")]
            counter!("revision_throttle_calls_rejected_total", "revision" => self.name.clone())
                .increment(1);

            return Err(BreakerError::Overload {
                queue_depth: self.params.queue_depth,
            });
        }

        // Guards the pending slot claimed above: dropped exactly once,
        // either here after the wait settles or by the enclosing future's
        // own drop if the caller cancels while still queued.
        let pending_guard = PendingGuard::new(&self.pending);

        let wait_started = Instant::now();
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match wait_bound {
            None => acquire.await,
            Some(duration) => match tokio::time::timeout(duration, acquire).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    drop(pending_guard);
                    let event = BreakerEvent::CallCancelled {
                        pattern_name: self.name.clone(),
                        timestamp: Instant::now(),
                        waited: wait_started.elapsed(),
                    };
                    self.event_listeners.emit(&event);
                    return Err(BreakerError::Cancelled);
                }
            },
        };
        drop(pending_guard);

        match permit {
            Ok(permit) => Ok(permit),
            Err(_) => {
                // The semaphore is only closed if this breaker is dropped
                // mid-wait, which cannot happen while `&self` is held.
                let event = BreakerEvent::CallCancelled {
                    pattern_name: self.name.clone(),
                    timestamp: Instant::now(),
                    waited: wait_started.elapsed(),
                };
                self.event_listeners.emit(&event);
                Err(BreakerError::Cancelled)
            }
        }
    }

    /// Runs `f` under an already-acquired `permit`, emitting the
    /// permitted/finished events and releasing the permit on every exit
    /// path, including the returned future being dropped before `f`
    /// completes or a panic unwinding through it.
    async fn run_with_permit<F, Fut, T>(&self, permit: tokio::sync::OwnedSemaphorePermit, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let event = BreakerEvent::CallPermitted {
            pattern_name: self.name.clone(),
            timestamp: Instant::now(),
            in_flight,
        };
        self.event_listeners.emit(&event);

        #[cfg(feature = "metrics")]
        {
            counter!("revision_throttle_calls_permitted_total", "revision" => self.name.clone())
                .increment(1);
            gauge!("revision_throttle_in_flight", "revision" => self.name.clone())
                .set(in_flight as f64);
        }

        // Guards the permit and the in-flight count claimed above: released
        // exactly once, either explicitly below once `f` completes, or by
        // this future's own drop if the caller abandons it mid-poll.
        let permit_guard = PermitGuard::new(self, permit);

        let call_started = Instant::now();
        let output = f().await;
        let duration = call_started.elapsed();

        drop(permit_guard);

        let event = BreakerEvent::CallFinished {
            pattern_name: self.name.clone(),
            timestamp: Instant::now(),
            duration,
        };
        self.event_listeners.emit(&event);

        #[cfg(feature = "metrics")]
        counter!("revision_throttle_calls_finished_total", "revision" => self.name.clone())
            .increment(1);

        output
    }

    /// Releases a permit, forgetting it instead if there is outstanding
    /// shrink debt to pay down.
    fn release_permit(&self, permit: tokio::sync::OwnedSemaphorePermit) {
        let paid = self
            .shrink_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                if debt == 0 {
                    None
                } else {
                    Some(debt - 1)
                }
            })
            .is_ok();

        if paid {
            permit.forget();
        } else {
            drop(permit);
        }
    }

    /// Changes the breaker's capacity.
    ///
    /// Raising capacity wakes up to `new_capacity - old_capacity` queued
    /// waiters, in arrival order. Lowering capacity never aborts in-flight
    /// work; fewer admissions are made until in-flight work drains below
    /// the new capacity.
    pub fn update_concurrency(&self, new_capacity: u32) -> BreakerResult<()> {
        if new_capacity > self.params.max_concurrency {
            return Err(BreakerError::InvalidCapacity {
                requested: new_capacity,
                max: self.params.max_concurrency,
            });
        }

        let previous = self.capacity.swap(new_capacity, Ordering::AcqRel);

        match new_capacity.cmp(&previous) {
            std::cmp::Ordering::Greater => {
                let raise = new_capacity - previous;
                self.cancel_debt_then_add_permits(raise);
            }
            std::cmp::Ordering::Less => {
                let shrink = previous - new_capacity;
                self.acquire_and_forget_or_debt(shrink);
            }
            std::cmp::Ordering::Equal => {}
        }

        let event = BreakerEvent::CapacityChanged {
            pattern_name: self.name.clone(),
            timestamp: Instant::now(),
            previous,
            current: new_capacity,
        };
        self.event_listeners.emit(&event);

        #[cfg(feature = "metrics")]
        gauge!("revision_throttle_capacity", "revision" => self.name.clone())
            .set(new_capacity as f64);

        Ok(())
    }

    /// Raising capacity first cancels outstanding shrink debt (permits that
    /// were promised to the pool but not yet forgotten), then adds any
    /// remainder as genuinely new permits.
    fn cancel_debt_then_add_permits(&self, raise: u32) {
        let mut remaining = raise;
        loop {
            let debt = self.shrink_debt.load(Ordering::Acquire);
            if debt == 0 || remaining == 0 {
                break;
            }
            let cancel = debt.min(remaining);
            if self
                .shrink_debt
                .compare_exchange(
                    debt,
                    debt - cancel,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                remaining -= cancel;
                break;
            }
        }

        if remaining > 0 {
            self.semaphore.add_permits(remaining as usize);
        }
    }

    /// Lowering capacity immediately forgets as many currently-idle permits
    /// as are available; any shortfall becomes shrink debt that is paid
    /// down as in-flight permits complete (see [`Self::release_permit`]).
    fn acquire_and_forget_or_debt(&self, shrink: u32) {
        let forgotten = self.semaphore.forget_permits(shrink as usize) as u32;
        let shortfall = shrink - forgotten;
        if shortfall > 0 {
            self.shrink_debt.fetch_add(shortfall, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    fn params(queue_depth: usize, max_concurrency: u32, initial_capacity: u32) -> BreakerParams {
        BreakerParams::builder()
            .queue_depth(queue_depth)
            .max_concurrency(max_concurrency)
            .initial_capacity(initial_capacity)
            .build()
    }

    #[tokio::test]
    async fn admits_under_capacity() {
        let breaker = Breaker::new("test", params(10, 10, 1));
        let result = breaker.try_call(|| async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full() {
        let breaker = Arc::new(Breaker::new("test", params(1, 1, 1)));

        // Hold the only token.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| async { rx.await.ok() }).await })
        };
        tokio::task::yield_now().await;

        // Fill the one queue slot.
        let waiter = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| async { 1 }).await })
        };
        tokio::task::yield_now().await;

        // The next caller must be rejected synchronously.
        let result = breaker.try_call(|| async { 1 }).await;
        assert!(matches!(result, Err(BreakerError::Overload { queue_depth: 1 })));

        tx.send(()).ok();
        holder.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn raising_capacity_wakes_waiters_in_fifo_order() {
        let breaker = Arc::new(Breaker::new("test", params(10, 10, 0)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let breaker = Arc::clone(&breaker);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                breaker
                    .try_call(|| async move {
                        order.lock().push(i);
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        assert_eq!(breaker.pending(), 3);
        breaker.update_concurrency(3).unwrap();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn lowering_capacity_does_not_abort_in_flight_work() {
        let breaker = Arc::new(Breaker::new("test", params(10, 10, 2)));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| async { rx.await.ok() }).await })
        };
        tokio::task::yield_now().await;

        breaker.update_concurrency(0).unwrap();
        assert_eq!(breaker.capacity(), 0);

        tx.send(()).unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn capacity_shrink_then_raise_cancels_debt_before_adding_new_permits() {
        // All 4 permits held in flight, so shrinking has no idle permits to
        // forget and must fall back entirely to debt.
        let breaker = Arc::new(Breaker::new("test", params(10, 10, 4)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                breaker
                    .try_call(|| async { tokio::time::sleep(Duration::from_millis(50)).await })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        breaker.update_concurrency(1).unwrap();
        assert_eq!(breaker.shrink_debt.load(Ordering::Acquire), 3);
        assert_eq!(breaker.semaphore.available_permits(), 0);

        breaker.update_concurrency(2).unwrap();
        assert_eq!(breaker.shrink_debt.load(Ordering::Acquire), 2);
        assert_eq!(breaker.semaphore.available_permits(), 0);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn no_admissions_beyond_capacity_after_shrink() {
        let breaker = Arc::new(Breaker::new("test", params(10, 10, 3)));
        breaker.update_concurrency(1).unwrap();

        let admitted = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let breaker = Arc::clone(&breaker);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                breaker
                    .try_call(|| async {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 1);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_capacity_is_rejected_and_leaves_state_unchanged() {
        let breaker = Breaker::new("test", params(10, 10, 5));
        let result = breaker.update_concurrency(11);
        assert!(matches!(
            result,
            Err(BreakerError::InvalidCapacity {
                requested: 11,
                max: 10
            })
        ));
        assert_eq!(breaker.capacity(), 5);
    }

    #[tokio::test]
    async fn cancelling_a_queued_waiter_frees_its_pending_slot() {
        let breaker = Arc::new(Breaker::new("test", params(1, 1, 0)));

        let handle = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| async { 1 }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.pending(), 1);

        handle.abort();
        let _ = handle.await;

        // Cancellation must not leak the queue slot: a later caller must be
        // able to queue and run once capacity is raised.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(breaker.pending(), 0);

        breaker.update_concurrency(1).unwrap();
        let result = breaker.try_call(|| async { 2 }).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn aborting_an_admitted_task_releases_its_permit_and_pays_down_shrink_debt() {
        // Both permits are out (neither idle), so shrinking to 0 falls
        // entirely to shrink_debt; nothing but the two running tasks
        // finishing (or being aborted) can pay it down.
        let breaker = Arc::new(Breaker::new("test", params(10, 10, 2)));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let aborted = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| std::future::pending::<()>()).await })
        };
        let survivor = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.try_call(|| async { rx.await.ok() }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.in_flight(), 2);

        breaker.update_concurrency(0).unwrap();
        assert_eq!(breaker.shrink_debt.load(Ordering::Acquire), 2);

        // Abandon the first task mid-poll, the same way a `select!` losing
        // branch or a `JoinHandle::abort` would drop `run_with_permit`'s
        // future before `f` ever returns.
        aborted.abort();
        let _ = aborted.await;
        tokio::task::yield_now().await;

        assert_eq!(breaker.in_flight(), 1);
        assert_eq!(breaker.shrink_debt.load(Ordering::Acquire), 1);
        assert_eq!(breaker.semaphore.available_permits(), 0);

        tx.send(()).unwrap();
        survivor.await.unwrap().unwrap();

        assert_eq!(breaker.in_flight(), 0);
        assert_eq!(breaker.shrink_debt.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn try_call_with_timeout_cancels_a_waiter_that_times_out() {
        let breaker = Arc::new(Breaker::new("test", params(10, 1, 0)));

        let result = breaker
            .try_call_with_timeout(Duration::from_millis(10), || async { 1 })
            .await;

        assert!(matches!(result, Err(BreakerError::Cancelled)));
        assert_eq!(breaker.pending(), 0);
    }

    #[tokio::test]
    async fn try_call_with_timeout_admits_once_capacity_arrives_in_time() {
        let breaker = Arc::new(Breaker::new("test", params(10, 1, 0)));

        let waiter = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .try_call_with_timeout(Duration::from_millis(200), || async { "admitted" })
                    .await
            })
        };
        tokio::task::yield_now().await;

        breaker.update_concurrency(1).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "admitted");
    }
}
