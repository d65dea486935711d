//! Mutation controller.
//!
//! Side door into the cache: applies a caller-supplied update to the current
//! value of a key, writes the result and revalidates every observer of the
//! key. Never touches the in-flight registry.

use std::fmt;
use std::future::{self, Future};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::error::UpdaterError;
use super::keys::{CacheKey, CacheValue};
use super::scope::ScopeInner;
use super::store::CacheStore;

const METRIC_MUTATION: &str = "stampede_mutation_total";

type SuccessHook<K, V> = Box<dyn FnOnce(&V, &CacheStore<K, V>) + Send>;

/// Optional behavior of one mutation.
pub struct MutateOptions<K: CacheKey, V: CacheValue> {
    on_success: Option<SuccessHook<K, V>>,
}

impl<K: CacheKey, V: CacheValue> MutateOptions<K, V> {
    pub fn new() -> Self {
        Self { on_success: None }
    }

    /// Run `hook` with the new value after the cache write and before
    /// observers are revalidated.
    #[must_use]
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&V, &CacheStore<K, V>) + Send + 'static,
    {
        self.on_success = Some(Box::new(hook));
        self
    }
}

impl<K: CacheKey, V: CacheValue> Default for MutateOptions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for MutateOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutateOptions")
            .field("on_success", &self.on_success.is_some())
            .finish()
    }
}

/// Applies updates to cached values.
pub struct MutationController<K: CacheKey, V: CacheValue> {
    inner: Arc<ScopeInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for MutationController<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> MutationController<K, V> {
    pub(crate) fn new(inner: Arc<ScopeInner<K, V>>) -> Self {
        Self { inner }
    }

    /// Replace the value of `key` with whatever `updater` derives from it.
    ///
    /// `updater` receives the current cached value, if any. Returning
    /// `Ok(None)` leaves the cache untouched; an error is returned as-is and
    /// nothing is written or notified.
    #[instrument(skip_all, fields(key = ?key))]
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
        let previous = self.inner.store.get(&key);
        let had_previous = previous.is_some();

        let next = match updater(previous).await {
            Ok(next) => next,
            Err(error) => {
                warn!(key = ?key, error = %error, "Updater failed; cache left untouched");
                return Err(error);
            }
        };

        let Some(value) = next else {
            debug!(key = ?key, "Updater declined to produce a value");
            return Ok(None);
        };

        self.inner.store.set(key.clone(), value.clone());
        self.inner.failures.clear(&key);
        counter!(METRIC_MUTATION).increment(1);

        if let Some(hook) = options.on_success {
            hook(&value, &self.inner.store);
        }

        let notified = self.inner.bus.notify(&key);
        info!(key = ?key, had_previous, notified, "Mutation applied");

        Ok(Some(value))
    }

    /// Mutation with a synchronous updater.
    pub async fn update<F>(&self, key: K, update: F) -> Option<V>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let outcome = self
            .mutate(
                key,
                move |previous| future::ready(Ok(update(previous))),
                MutateOptions::new(),
            )
            .await;
        outcome.unwrap_or_default()
    }

    /// Overwrite the value of `key`.
    pub async fn set(&self, key: K, value: V) {
        self.update(key, move |_| Some(value)).await;
    }
}

/// Mutation handle bound to one key.
pub struct Mutation<K: CacheKey, V: CacheValue> {
    key: K,
    controller: MutationController<K, V>,
}

impl<K: CacheKey, V: CacheValue> Mutation<K, V> {
    pub(crate) fn new(key: K, controller: MutationController<K, V>) -> Self {
        Self { key, controller }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub async fn mutate<U, Fut>(&self, updater: U) -> Result<Option<V>, UpdaterError>
    where
        U: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<Option<V>, UpdaterError>>,
    {
        self.controller
            .mutate(self.key.clone(), updater, MutateOptions::new())
            .await
    }

    pub async fn mutate_with<U, Fut>(
        &self,
        updater: U,
        options: MutateOptions<K, V>,
    ) -> Result<Option<V>, UpdaterError>
    where
        U: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<Option<V>, UpdaterError>>,
    {
        self.controller
            .mutate(self.key.clone(), updater, options)
            .await
    }

    pub async fn update<F>(&self, update: F) -> Option<V>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        self.controller.update(self.key.clone(), update).await
    }

    pub async fn set(&self, value: V) {
        self.controller.set(self.key.clone(), value).await;
    }
}

impl<K: CacheKey, V: CacheValue> Clone for Mutation<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            controller: self.controller.clone(),
        }
    }
}
