//! Key and value bounds shared by every cache component.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

/// Anything that can address a cache entry.
///
/// Keys are opaque to the cache: they are only hashed, compared, cloned into
/// maps and printed in logs.
pub trait CacheKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Anything that can be stored in a cache entry and handed to many observers.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Identity of one observer within a cache scope.
///
/// Allocated by the scope's revalidation bus; unique for the lifetime of the
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}
