//! Cache storage.
//!
//! Maps each key to its last-known-good value. Every write is stamped with a
//! monotonic epoch so a production can tell whether a mutation landed while
//! it was running.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::keys::{CacheKey, CacheValue};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Monotonic store write counter.
///
/// Epoch 0 means "nothing written yet"; the first write is stamped 1.
pub type Epoch = u64;

/// Who wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Seeded when the scope was built (pre-populated or hydrated).
    Seed,
    /// Committed by a settled production.
    Production,
    /// Written by a mutation.
    Mutation,
}

#[derive(Debug, Clone)]
struct StoredEntry<V> {
    value: V,
    epoch: Epoch,
    origin: WriteOrigin,
}

/// Outcome of committing a production's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Commit<V> {
    /// The production's value is now the cached value.
    Written(V),
    /// A mutation landed after the production started; its value was kept.
    Superseded(V),
}

impl<V> Commit<V> {
    /// The value the key holds after the commit.
    pub(crate) fn into_value(self) -> V {
        match self {
            Self::Written(value) | Self::Superseded(value) => value,
        }
    }
}

/// Key to last-known-good value.
///
/// Holds no concurrency logic beyond atomic individual reads and writes.
pub struct CacheStore<K, V> {
    entries: RwLock<HashMap<K, StoredEntry<V>>>,
    epoch_counter: AtomicU64,
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Create a store pre-populated with `entries`.
    pub fn seeded(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        let store = Self::new();
        {
            let mut map = rw_write(&store.entries, SOURCE, "seeded");
            for (key, value) in entries {
                let epoch = store.next_epoch();
                map.insert(
                    key,
                    StoredEntry {
                        value,
                        epoch,
                        origin: WriteOrigin::Seed,
                    },
                );
            }
        }
        store
    }

    // Only called with the write lock held, so epochs follow write order.
    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Epoch of the most recent write to any key.
    pub fn current_epoch(&self) -> Epoch {
        self.epoch_counter.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        rw_read(&self.entries, SOURCE, "get")
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn has(&self, key: &K) -> bool {
        rw_read(&self.entries, SOURCE, "has").contains_key(key)
    }

    /// Origin and epoch of the current entry for `key`.
    pub fn provenance(&self, key: &K) -> Option<(WriteOrigin, Epoch)> {
        rw_read(&self.entries, SOURCE, "provenance")
            .get(key)
            .map(|entry| (entry.origin, entry.epoch))
    }

    /// Write `value` as a mutation.
    pub(crate) fn set(&self, key: K, value: V) {
        let mut map = rw_write(&self.entries, SOURCE, "set");
        let epoch = self.next_epoch();
        map.insert(
            key,
            StoredEntry {
                value,
                epoch,
                origin: WriteOrigin::Mutation,
            },
        );
    }

    /// Write the value of a production that started at `started_at`.
    ///
    /// A mutation stamped after `started_at` wins over the production: the
    /// mutated value is kept and reported back as the effective value.
    pub(crate) fn commit(&self, key: K, value: V, started_at: Epoch) -> Commit<V> {
        let mut map = rw_write(&self.entries, SOURCE, "commit");

        if let Some(mutated) = superseding_value(&map, &key, started_at) {
            return Commit::Superseded(mutated);
        }

        let epoch = self.next_epoch();
        map.insert(
            key,
            StoredEntry {
                value: value.clone(),
                epoch,
                origin: WriteOrigin::Production,
            },
        );
        Commit::Written(value)
    }

    /// Value of a mutation that landed on `key` after `started_at`, if any.
    pub(crate) fn superseding(&self, key: &K, started_at: Epoch) -> Option<V> {
        superseding_value(&rw_read(&self.entries, SOURCE, "superseding"), key, started_at)
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        rw_write(&self.entries, SOURCE, "remove")
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Clear all cached data.
    pub(crate) fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Copy of every cached value.
    pub fn entries(&self) -> HashMap<K, V> {
        rw_read(&self.entries, SOURCE, "entries")
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn superseding_value<K: CacheKey, V: CacheValue>(
    map: &HashMap<K, StoredEntry<V>>,
    key: &K,
    started_at: Epoch,
) -> Option<V> {
    map.get(key)
        .filter(|entry| entry.origin == WriteOrigin::Mutation && entry.epoch > started_at)
        .map(|entry| entry.value.clone())
}

impl<K: CacheKey, V: CacheValue> Default for CacheStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
