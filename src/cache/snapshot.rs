//! Read-only copies of a scope's cached values.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Every cached value of a scope at one point in time.
///
/// Produced by [`CacheScope::cache_snapshot`](super::CacheScope::cache_snapshot)
/// and by a capture pass; accepted by
/// [`CacheScope::hydrate`](super::CacheScope::hydrate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + Hash, V: Serialize",
    deserialize = "K: Deserialize<'de> + Eq + Hash, V: Deserialize<'de>"
))]
pub struct CacheSnapshot<K: Eq + Hash, V> {
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V> CacheSnapshot<K, V> {
    pub fn new(entries: HashMap<K, V>) -> Self {
        Self {
            captured_at: OffsetDateTime::now_utc(),
            entries,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
