//! Query coordination.
//!
//! Decides, for one observer asking for one key, whether to serve the cache,
//! attach to a running production or start a new one, and runs productions
//! to completion.

use std::fmt;
use std::future::Future;
use std::mem;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::error::ProducerError;
use super::inflight::{Claim, PendingProduction, StartedProduction};
use super::keys::{CacheKey, CacheValue, ObserverId};
use super::revalidate::RevalidationCallback;
use super::scope::ScopeInner;
use super::state::{QueryEvent, QueryState};
use super::store::Commit;
use super::subscription::Subscription;

const METRIC_CACHE_HIT: &str = "stampede_cache_hit_total";
const METRIC_CACHE_MISS: &str = "stampede_cache_miss_total";
const METRIC_COALESCED: &str = "stampede_coalesced_total";
const METRIC_PRODUCTION_STARTED: &str = "stampede_production_started_total";
const METRIC_PRODUCTION_FAILED: &str = "stampede_production_failed_total";
const METRIC_PRODUCTION_MS: &str = "stampede_production_ms";
const METRIC_BACKOFF_SUPPRESSED: &str = "stampede_backoff_suppressed_total";

/// Future returned by a [`Producer`].
pub type ProducerFuture<V> = BoxFuture<'static, Result<V, ProducerError>>;

/// Asynchronous function producing the value of a key.
///
/// Invoked at most once per production, inside the production's task.
pub struct Producer<V> {
    produce: Arc<dyn Fn() -> ProducerFuture<V> + Send + Sync>,
}

impl<V: CacheValue> Producer<V> {
    pub fn new<F, Fut>(produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ProducerError>> + Send + 'static,
    {
        Self {
            produce: Arc::new(move || produce().boxed()),
        }
    }

    fn produce(&self) -> ProducerFuture<V> {
        (self.produce)()
    }
}

impl<V> Clone for Producer<V> {
    fn clone(&self) -> Self {
        Self {
            produce: Arc::clone(&self.produce),
        }
    }
}

impl<V> fmt::Debug for Producer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

/// What an observer gets when it asks for a key.
enum Acquired<V: CacheValue> {
    Cached(V),
    /// The key failed recently and is inside its backoff window.
    Suppressed(ProducerError),
    /// A production is running for the key (started or joined).
    Pending(PendingProduction<V>),
}

/// Orchestrates observers, productions and the cache for one scope.
pub struct QueryCoordinator<K: CacheKey, V: CacheValue> {
    inner: Arc<ScopeInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for QueryCoordinator<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> QueryCoordinator<K, V> {
    pub(crate) fn new(inner: Arc<ScopeInner<K, V>>) -> Self {
        Self { inner }
    }

    /// Subscribe a new observer to `key`.
    ///
    /// The returned subscription is already `Success` when the key is cached
    /// and `Loading` when a production was started or joined. Must be called
    /// from within a Tokio runtime.
    #[instrument(level = "debug", skip_all, fields(key = ?key))]
    pub fn observe(&self, key: K, producer: Producer<V>) -> Subscription<K, V> {
        let observer = self.inner.bus.next_observer();
        let state = Arc::new(watch::channel(QueryState::None).0);
        let capture = self.inner.config.is_capture();

        // Registered before the cache lookup so a mutation landing in between
        // still reaches this observer.
        if !capture {
            self.inner.bus.register(
                key.clone(),
                observer,
                revalidation_callback(Arc::downgrade(&self.inner), key.clone(), &state),
            );
        }

        let listener = match self.acquire(&key, &producer, observer) {
            Acquired::Cached(value) => {
                apply(&state, QueryEvent::Resolved(value));
                None
            }
            Acquired::Suppressed(error) => {
                apply(&state, QueryEvent::Rejected(error));
                None
            }
            Acquired::Pending(pending) => {
                apply(&state, QueryEvent::Initiate);
                if capture {
                    None
                } else {
                    Some(self.listen(key.clone(), pending, Arc::clone(&state)))
                }
            }
        };

        Subscription::new(
            key,
            observer,
            producer,
            self.clone(),
            state,
            listener,
            !capture,
        )
    }

    /// Produce `key` again, even if it is cached.
    ///
    /// Joins the running production instead when one is in flight. Resolves
    /// to the mutated value when a mutation lands while the production runs,
    /// even if the producer itself fails.
    #[instrument(skip_all, fields(key = ?key))]
    pub async fn refresh(&self, key: K, producer: Producer<V>) -> Result<V, ProducerError> {
        self.refresh_from(key, &producer, None).await
    }

    pub(crate) async fn refresh_from(
        &self,
        key: K,
        producer: &Producer<V>,
        origin: Option<ObserverId>,
    ) -> Result<V, ProducerError> {
        self.acquire_refresh(&key, producer, origin).wait().await
    }

    /// Start or join a production regardless of the cache and the failure
    /// backoff.
    pub(crate) fn acquire_refresh(
        &self,
        key: &K,
        producer: &Producer<V>,
        origin: Option<ObserverId>,
    ) -> PendingProduction<V> {
        if let Some(pending) = self.inner.inflight.get(key) {
            counter!(METRIC_COALESCED).increment(1);
            debug!(key = ?key, production_id = %pending.id(), "Joined in-flight production");
            return pending;
        }

        let started_at = self.inner.store.current_epoch();
        let claim = self.inner.inflight.claim(key.clone(), started_at);
        self.take_claim(key, producer, claim, origin)
    }

    fn acquire(&self, key: &K, producer: &Producer<V>, origin: ObserverId) -> Acquired<V> {
        let inner = &self.inner;

        if let Some(value) = inner.store.get(key) {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!(key = ?key, "Cache hit");
            return Acquired::Cached(value);
        }
        counter!(METRIC_CACHE_MISS).increment(1);

        if let Some(pending) = inner.inflight.get(key) {
            counter!(METRIC_COALESCED).increment(1);
            debug!(key = ?key, production_id = %pending.id(), "Joined in-flight production");
            return Acquired::Pending(pending);
        }

        if let Some(error) = inner.failures.suppressed(key, &inner.config) {
            counter!(METRIC_BACKOFF_SUPPRESSED).increment(1);
            info!(key = ?key, error = %error, "Production suppressed by failure backoff");
            return Acquired::Suppressed(error);
        }

        let started_at = inner.store.current_epoch();
        match inner
            .inflight
            .claim_unless_cached(key.clone(), started_at, || inner.store.get(key))
        {
            ControlFlow::Break(value) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                Acquired::Cached(value)
            }
            ControlFlow::Continue(claim) => {
                Acquired::Pending(self.take_claim(key, producer, claim, Some(origin)))
            }
        }
    }

    fn take_claim(
        &self,
        key: &K,
        producer: &Producer<V>,
        claim: Claim<K, V>,
        origin: Option<ObserverId>,
    ) -> PendingProduction<V> {
        match claim {
            Claim::Joined(pending) => {
                counter!(METRIC_COALESCED).increment(1);
                debug!(key = ?key, production_id = %pending.id(), "Joined in-flight production");
                pending
            }
            Claim::Started(started) => {
                let pending = started.pending.clone();
                self.launch(key.clone(), producer.clone(), started, origin);
                pending
            }
        }
    }

    /// Run a freshly registered production on its own task.
    ///
    /// The task owns the registry guard, so the key is released however the
    /// producer ends. Nothing cancels the task once spawned.
    ///
    /// A mutation written after the production started wins whether the
    /// producer succeeds or fails: every waiter receives the mutated value
    /// and a failure is not recorded against the key.
    fn launch(
        &self,
        key: K,
        producer: Producer<V>,
        started: StartedProduction<K, V>,
        origin: Option<ObserverId>,
    ) {
        let StartedProduction {
            pending,
            outcome,
            guard,
        } = started;
        let production_id = pending.id();
        let started_at = pending.started_at();
        let inner = Arc::clone(&self.inner);
        let span = info_span!("production", production_id = %production_id, key = ?key);

        counter!(METRIC_PRODUCTION_STARTED).increment(1);
        info!(
            production_id = %production_id,
            key = ?key,
            started_at,
            "Production started"
        );

        tokio::spawn(
            async move {
                let clock = Instant::now();
                let produced = AssertUnwindSafe(async move { producer.produce().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(ProducerError::panicked(payload.as_ref())));
                let elapsed_ms = clock.elapsed().as_secs_f64() * 1000.0;

                let settled = match produced {
                    Ok(value) => {
                        let commit = inner.store.commit(key.clone(), value, started_at);
                        inner.failures.clear(&key);
                        if matches!(commit, Commit::Superseded(_)) {
                            info!(
                                elapsed_ms,
                                "Production superseded by a later mutation; keeping mutated value"
                            );
                        } else {
                            info!(elapsed_ms, "Production settled");
                        }
                        Ok(commit.into_value())
                    }
                    Err(error) => match inner.store.superseding(&key, started_at) {
                        Some(mutated) => {
                            info!(
                                elapsed_ms,
                                error = %error,
                                "Production failed after a later mutation; keeping mutated value"
                            );
                            Ok(mutated)
                        }
                        None => {
                            let consecutive = inner.failures.record(key.clone(), error.clone());
                            counter!(METRIC_PRODUCTION_FAILED).increment(1);
                            warn!(
                                elapsed_ms,
                                consecutive,
                                error = %error,
                                "Production failed"
                            );
                            Err(error)
                        }
                    },
                };

                drop(guard);
                histogram!(METRIC_PRODUCTION_MS).record(elapsed_ms);

                let succeeded = settled.is_ok();
                // Every observer may have detached; the cache is updated regardless.
                let _ = outcome.send(settled);

                if succeeded {
                    match origin {
                        Some(origin) => inner.bus.notify_except(&key, origin),
                        None => inner.bus.notify(&key),
                    };
                }
            }
            .instrument(span),
        );
    }

    /// Deliver the outcome of `pending` into `state` from a listener task.
    pub(crate) fn listen(
        &self,
        key: K,
        pending: PendingProduction<V>,
        state: Arc<watch::Sender<QueryState<V>>>,
    ) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let started_at = pending.started_at();
        tokio::spawn(async move {
            let event = match pending.wait().await {
                // A mutation may have landed after the commit; the cache holds
                // the newest value.
                Ok(value) => QueryEvent::Resolved(inner.store.get(&key).unwrap_or(value)),
                Err(error) => match inner.store.superseding(&key, started_at) {
                    Some(mutated) => QueryEvent::Resolved(mutated),
                    None => QueryEvent::Rejected(error),
                },
            };
            apply(&state, event);
        })
        .abort_handle()
    }

    pub(crate) fn unregister(&self, key: &K, observer: ObserverId) {
        self.inner.bus.unregister(key, observer);
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for QueryCoordinator<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("in_flight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

/// Apply `event` to an observer's state and wake its watchers.
pub(crate) fn apply<V>(state: &watch::Sender<QueryState<V>>, event: QueryEvent<V>) {
    state.send_modify(|current| {
        let previous = mem::take(current);
        *current = previous.transition(event);
    });
}

fn revalidation_callback<K: CacheKey, V: CacheValue>(
    inner: Weak<ScopeInner<K, V>>,
    key: K,
    state: &Arc<watch::Sender<QueryState<V>>>,
) -> RevalidationCallback {
    let state = Arc::downgrade(state);
    Arc::new(move || {
        let (Some(inner), Some(state)) = (inner.upgrade(), state.upgrade()) else {
            return;
        };
        if let Some(value) = inner.store.get(&key) {
            apply(&state, QueryEvent::Revalidated(value));
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheConfig, CacheScope, Status};

    fn counted(calls: &Arc<AtomicUsize>, value: &'static str) -> Producer<&'static str> {
        let calls = Arc::clone(calls);
        Producer::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
        })
    }

    async fn explode() -> Result<&'static str, ProducerError> {
        panic!("producer exploded")
    }

    #[tokio::test(start_paused = true)]
    async fn observe_then_settle() {
        let scope = CacheScope::<&str, &str>::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut subscription = scope.queries().observe("/a", counted(&calls, "test"));
        assert_eq!(subscription.status(), Status::Loading);

        let state = subscription.settled().await;
        assert_eq!(state, QueryState::Success("test"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scope.peek(&"/a"), Some("test"));
        assert!(!scope.is_in_flight(&"/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_joins_in_flight_production() {
        let scope = CacheScope::<&str, &str>::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let queries = scope.queries();

        let _subscription = queries.observe("/a", counted(&calls, "first"));
        let refreshed = queries.refresh("/a", counted(&calls, "second")).await;

        assert_eq!(refreshed, Ok("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_producer_releases_key() {
        let scope = CacheScope::<&str, &str>::new(CacheConfig::without_backoff());
        let queries = scope.queries();

        let mut subscription = queries.observe("/a", Producer::new(explode));
        let state = subscription.settled().await;
        let error = state.error().expect("panic surfaces as error");
        assert!(error.to_string().contains("producer exploded"));
        assert!(!scope.is_in_flight(&"/a"));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut retry = queries.observe("/a", counted(&calls, "recovered"));
        assert_eq!(retry.settled().await, QueryState::Success("recovered"));
    }

    #[test]
    fn apply_runs_transition() {
        let (sender, receiver) = watch::channel(QueryState::<u8>::None);
        apply(&sender, QueryEvent::Initiate);
        assert_eq!(*receiver.borrow(), QueryState::Loading);
        apply(&sender, QueryEvent::Resolved(4));
        assert_eq!(*receiver.borrow(), QueryState::Success(4));
    }
}
