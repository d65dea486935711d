//! Cache scope.
//!
//! One independent cache instance: store, in-flight registry, revalidation
//! bus and failure log, shared behind a cheap handle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument};

use super::config::{CacheConfig, ExecutionMode};
use super::error::{ProducerError, UpdaterError};
use super::inflight::InFlightRegistry;
use super::keys::{CacheKey, CacheValue};
use super::mutation::{MutateOptions, Mutation, MutationController};
use super::query::{Producer, QueryCoordinator};
use super::retry::FailureLog;
use super::revalidate::RevalidationBus;
use super::snapshot::CacheSnapshot;
use super::store::CacheStore;
use super::subscription::Subscription;

pub(crate) struct ScopeInner<K: CacheKey, V: CacheValue> {
    pub(crate) config: CacheConfig,
    pub(crate) store: CacheStore<K, V>,
    pub(crate) inflight: InFlightRegistry<K, V>,
    pub(crate) bus: RevalidationBus<K>,
    pub(crate) failures: FailureLog<K>,
}

/// Handle to one cache instance.
///
/// Clones share the same cache. Keys are unique only within a scope; nothing
/// is shared between scopes.
pub struct CacheScope<K: CacheKey, V: CacheValue> {
    inner: Arc<ScopeInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for CacheScope<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheScope<K, V> {
    /// Create an empty scope.
    pub fn new(config: CacheConfig) -> Self {
        Self::from_store(config, CacheStore::new())
    }

    /// Create a scope whose cache is pre-populated with `entries`.
    pub fn with_entries(config: CacheConfig, entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::from_store(config, CacheStore::seeded(entries))
    }

    /// Seed an interactive scope from a captured snapshot.
    pub fn hydrate(config: CacheConfig, snapshot: CacheSnapshot<K, V>) -> Self {
        let config = CacheConfig {
            mode: ExecutionMode::Interactive,
            ..config
        };
        info!(
            entries = snapshot.len(),
            captured_at = %snapshot.captured_at,
            "Hydrating cache scope from snapshot"
        );
        Self::with_entries(config, snapshot.entries)
    }

    fn from_store(config: CacheConfig, store: CacheStore<K, V>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                config,
                store,
                inflight: InFlightRegistry::new(),
                bus: RevalidationBus::new(),
                failures: FailureLog::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore<K, V> {
        &self.inner.store
    }

    pub fn queries(&self) -> QueryCoordinator<K, V> {
        QueryCoordinator::new(Arc::clone(&self.inner))
    }

    pub fn mutations(&self) -> MutationController<K, V> {
        MutationController::new(Arc::clone(&self.inner))
    }

    /// Subscribe to `key`, producing it with `producer` if needed.
    pub fn observe<F, Fut>(&self, key: K, producer: F) -> Subscription<K, V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ProducerError>> + Send + 'static,
    {
        self.observe_with(key, Producer::new(producer))
    }

    /// Same as [`observe`](Self::observe) with a shareable producer.
    pub fn observe_with(&self, key: K, producer: Producer<V>) -> Subscription<K, V> {
        self.queries().observe(key, producer)
    }

    /// Produce `key` again even if it is cached, and return the outcome.
    pub async fn refresh<F, Fut>(&self, key: K, producer: F) -> Result<V, ProducerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ProducerError>> + Send + 'static,
    {
        self.refresh_with(key, Producer::new(producer)).await
    }

    pub async fn refresh_with(&self, key: K, producer: Producer<V>) -> Result<V, ProducerError> {
        self.queries().refresh(key, producer).await
    }

    /// Apply `updater` to the cached value of `key`.
    pub async fn mutate<U, Fut>(
        &self,
        key: K,
        updater: U,
        options: MutateOptions<K, V>,
    ) -> Result<Option<V>, UpdaterError>
    where
        U: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<Option<V>, UpdaterError>>,
    {
        self.mutations().mutate(key, updater, options).await
    }

    /// Mutation handle bound to `key`.
    pub fn mutation(&self, key: K) -> Mutation<K, V> {
        Mutation::new(key, self.mutations())
    }

    /// Cached value of `key`, without subscribing.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.store.get(key)
    }

    /// Read-only copy of every cached value.
    pub fn cache_snapshot(&self) -> CacheSnapshot<K, V> {
        CacheSnapshot::new(self.inner.store.entries())
    }

    /// Number of productions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner.inflight.contains(key)
    }

    /// Failed productions of `key` since its last successful write.
    pub fn consecutive_failures(&self, key: &K) -> u32 {
        self.inner.failures.consecutive_failures(key)
    }

    /// Number of live observers registered for revalidation of `key`.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner.bus.subscriber_count(key)
    }

    /// Await every outstanding production, then snapshot the cache.
    ///
    /// Productions started while waiting are awaited as well; returns once
    /// the registry is empty.
    #[instrument(skip_all)]
    pub async fn settle_pending(&self) -> CacheSnapshot<K, V> {
        let mut rounds = 0_u32;
        loop {
            let pending = self.inner.inflight.pending();
            if pending.is_empty() {
                break;
            }
            rounds += 1;
            debug!(round = rounds, productions = pending.len(), "Awaiting pending productions");
            join_all(pending.into_iter().map(|(_, production)| production.wait())).await;
        }

        let snapshot = self.cache_snapshot();
        info!(rounds, entries = snapshot.len(), "Pending productions settled");
        snapshot
    }

    /// Drop the cached value of `key` without notifying observers.
    ///
    /// The next observation of the key produces it again.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.inner.failures.clear(key);
        self.inner.store.remove(key)
    }

    /// Drop every cached value without notifying observers.
    pub fn clear(&self) {
        self.inner.failures.clear_all();
        self.inner.store.clear();
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for CacheScope<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheScope")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.store.len())
            .field("in_flight", &self.inner.inflight.len())
            .finish()
    }
}
