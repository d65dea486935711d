//! Revalidation bus.
//!
//! Fans a "this key changed" signal out to every observer currently
//! interested in the key. Callbacks re-read the cache themselves; the bus
//! carries no values.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

use metrics::counter;
use tracing::{debug, warn};

use super::keys::{CacheKey, ObserverId};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::revalidate";
const METRIC_REVALIDATION: &str = "stampede_revalidation_total";

/// Notification callback registered by one observer.
pub type RevalidationCallback = Arc<dyn Fn() + Send + Sync>;

/// Key to the callbacks of the observers interested in it.
pub struct RevalidationBus<K: CacheKey> {
    callbacks: RwLock<HashMap<K, HashMap<ObserverId, RevalidationCallback>>>,
    /// Keys currently being notified, per notifying thread.
    notifying: Mutex<HashSet<(K, ThreadId)>>,
    next_observer: AtomicU64,
}

impl<K: CacheKey> RevalidationBus<K> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            notifying: Mutex::new(HashSet::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh observer identity.
    pub fn next_observer(&self) -> ObserverId {
        ObserverId::new(self.next_observer.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `callback` for `observer` on `key`.
    ///
    /// Returns true if a previous callback of the same observer was replaced.
    pub fn register(&self, key: K, observer: ObserverId, callback: RevalidationCallback) -> bool {
        rw_write(&self.callbacks, SOURCE, "register")
            .entry(key)
            .or_default()
            .insert(observer, callback)
            .is_some()
    }

    /// Remove the callback of `observer` on `key`, if any.
    pub fn unregister(&self, key: &K, observer: ObserverId) -> bool {
        let mut callbacks = rw_write(&self.callbacks, SOURCE, "unregister");
        let Some(observers) = callbacks.get_mut(key) else {
            return false;
        };
        let removed = observers.remove(&observer).is_some();
        if observers.is_empty() {
            callbacks.remove(key);
        }
        removed
    }

    /// Invoke every callback registered for `key`.
    pub fn notify(&self, key: &K) -> usize {
        self.fan_out(key, None)
    }

    /// Invoke every callback registered for `key` except `origin`'s.
    pub fn notify_except(&self, key: &K, origin: ObserverId) -> usize {
        self.fan_out(key, Some(origin))
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        rw_read(&self.callbacks, SOURCE, "subscriber_count")
            .get(key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn fan_out(&self, key: &K, skip: Option<ObserverId>) -> usize {
        let marker = (key.clone(), thread::current().id());
        if !mutex_lock(&self.notifying, SOURCE, "fan_out.enter").insert(marker.clone()) {
            warn!(
                key = ?key,
                "Suppressed re-entrant revalidation of a key already being notified"
            );
            return 0;
        }
        let _reset = NotifyingReset {
            notifying: &self.notifying,
            marker: Some(marker),
        };

        // Callbacks run outside the bus lock so they may register or
        // unregister observers themselves.
        let targets: Vec<RevalidationCallback> = rw_read(&self.callbacks, SOURCE, "fan_out")
            .get(key)
            .map(|observers| {
                observers
                    .iter()
                    .filter(|(observer, _)| Some(**observer) != skip)
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect()
            })
            .unwrap_or_default();

        for callback in &targets {
            callback();
        }

        if !targets.is_empty() {
            counter!(METRIC_REVALIDATION).increment(targets.len() as u64);
        }
        debug!(key = ?key, notified = targets.len(), "Revalidation fanned out");
        targets.len()
    }
}

impl<K: CacheKey> Default for RevalidationBus<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey> fmt::Debug for RevalidationBus<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = rw_read(&self.callbacks, SOURCE, "debug").len();
        f.debug_struct("RevalidationBus")
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

struct NotifyingReset<'a, K: CacheKey> {
    notifying: &'a Mutex<HashSet<(K, ThreadId)>>,
    marker: Option<(K, ThreadId)>,
}

impl<K: CacheKey> Drop for NotifyingReset<'_, K> {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            mutex_lock(self.notifying, SOURCE, "fan_out.exit").remove(&marker);
        }
    }
}
