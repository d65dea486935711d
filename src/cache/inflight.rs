//! In-flight production registry.
//!
//! Tracks the single pending production for each key so concurrent
//! requesters can be coalesced onto it.

use std::convert::Infallible;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::gauge;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::ProducerError;
use super::keys::{CacheKey, CacheValue};
use super::store::Epoch;

const METRIC_INFLIGHT: &str = "stampede_inflight";

pub(crate) type ProductionResult<V> = Result<V, ProducerError>;

type SharedProduction<V> = Shared<BoxFuture<'static, ProductionResult<V>>>;

/// Handle to one running production.
///
/// Cloning is cheap; every clone resolves to the same value or the same
/// error.
#[derive(Clone)]
pub struct PendingProduction<V: CacheValue> {
    id: Uuid,
    started_at: Epoch,
    outcome: SharedProduction<V>,
}

impl<V: CacheValue> PendingProduction<V> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Store epoch observed when the production started.
    pub fn started_at(&self) -> Epoch {
        self.started_at
    }

    /// Returns true once the production has delivered its outcome.
    pub fn is_settled(&self) -> bool {
        self.outcome.peek().is_some()
    }

    /// Wait for the production's outcome.
    pub async fn wait(self) -> ProductionResult<V> {
        self.outcome.await
    }
}

impl<V: CacheValue> fmt::Debug for PendingProduction<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingProduction")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Everything the starter of a new production needs to run it.
pub(crate) struct StartedProduction<K: CacheKey, V: CacheValue> {
    pub(crate) pending: PendingProduction<V>,
    pub(crate) outcome: oneshot::Sender<ProductionResult<V>>,
    pub(crate) guard: ProductionGuard<K, V>,
}

/// Result of claiming the production slot of a key.
pub(crate) enum Claim<K: CacheKey, V: CacheValue> {
    /// Another production was already running; attach to it.
    Joined(PendingProduction<V>),
    /// The caller owns a freshly registered production and must run it.
    Started(StartedProduction<K, V>),
}

/// Key to the single pending production for that key.
pub struct InFlightRegistry<K: CacheKey, V: CacheValue> {
    productions: Arc<DashMap<K, PendingProduction<V>>>,
}

impl<K: CacheKey, V: CacheValue> InFlightRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            productions: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<PendingProduction<V>> {
        self.productions.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.productions.contains_key(key)
    }

    /// Snapshot of every outstanding production.
    pub fn pending(&self) -> Vec<(K, PendingProduction<V>)> {
        self.productions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.productions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.productions.is_empty()
    }

    /// Join the production registered for `key` or register a new one.
    pub(crate) fn claim(&self, key: K, started_at: Epoch) -> Claim<K, V> {
        let ControlFlow::Continue(claim) =
            self.claim_checked(key, started_at, || ControlFlow::<Infallible>::Continue(()));
        claim
    }

    /// Like [`claim`](Self::claim), but breaks with the cached value when
    /// `recheck` finds one before a new production is registered.
    ///
    /// Runs under the key's shard lock, so a production which committed and
    /// deregistered between the caller's cache lookup and this call is not
    /// repeated. `recheck` is not consulted while a production is running.
    pub(crate) fn claim_unless_cached<R>(
        &self,
        key: K,
        started_at: Epoch,
        recheck: R,
    ) -> ControlFlow<V, Claim<K, V>>
    where
        R: FnOnce() -> Option<V>,
    {
        self.claim_checked(key, started_at, || match recheck() {
            Some(value) => ControlFlow::Break(value),
            None => ControlFlow::Continue(()),
        })
    }

    fn claim_checked<B, R>(
        &self,
        key: K,
        started_at: Epoch,
        recheck: R,
    ) -> ControlFlow<B, Claim<K, V>>
    where
        R: FnOnce() -> ControlFlow<B>,
    {
        let claim = match self.productions.entry(key) {
            Entry::Occupied(occupied) => Claim::Joined(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                if let ControlFlow::Break(cached) = recheck() {
                    return ControlFlow::Break(cached);
                }

                let id = Uuid::new_v4();
                let (sender, receiver) = oneshot::channel();
                let outcome = receiver
                    .map(|delivered| delivered.unwrap_or_else(|_| Err(ProducerError::abandoned())))
                    .boxed()
                    .shared();
                let pending = PendingProduction {
                    id,
                    started_at,
                    outcome,
                };
                let guard = ProductionGuard {
                    key: vacant.key().clone(),
                    id,
                    productions: Arc::clone(&self.productions),
                };
                vacant.insert(pending.clone());

                Claim::Started(StartedProduction {
                    pending,
                    outcome: sender,
                    guard,
                })
            }
        };

        gauge!(METRIC_INFLIGHT).set(self.productions.len() as f64);
        ControlFlow::Continue(claim)
    }
}

impl<K: CacheKey, V: CacheValue> Default for InFlightRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregisters a production when dropped.
///
/// Owned by the task running the production, so the entry is removed on
/// success, on failure and while unwinding from a panic alike.
pub(crate) struct ProductionGuard<K: CacheKey, V: CacheValue> {
    key: K,
    id: Uuid,
    productions: Arc<DashMap<K, PendingProduction<V>>>,
}

impl<K: CacheKey, V: CacheValue> Drop for ProductionGuard<K, V> {
    fn drop(&mut self) {
        self.productions
            .remove_if(&self.key, |_, pending| pending.id == self.id);
        gauge!(METRIC_INFLIGHT).set(self.productions.len() as f64);
    }
}
