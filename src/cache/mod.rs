//! Stampede cache engine.
//!
//! A key-addressed cache with request coalescing:
//!
//! - a cached key is served immediately, without invoking its producer
//! - concurrent observers of an uncached key share a single production
//! - mutations write the cache directly and revalidate every observer of
//!   the key
//!
//! Everything lives in a [`CacheScope`]; scopes share nothing.
//!
//! ## Configuration
//!
//! The failure backoff is controlled via the `[cache]` section of
//! `stampede.toml`:
//!
//! ```toml
//! [cache]
//! failure_backoff_base_ms = 1000
//! failure_backoff_max_ms = 30000
//! ```

mod config;
mod error;
mod inflight;
mod keys;
mod lock;
mod mutation;
mod query;
mod retry;
mod revalidate;
mod scope;
mod snapshot;
mod state;
mod store;
mod subscription;

pub use config::{
    CacheConfig, DEFAULT_FAILURE_BACKOFF_BASE_MS, DEFAULT_FAILURE_BACKOFF_MAX_MS, ExecutionMode,
};
pub(crate) use config::saturating_millis;
pub use error::{ProducerError, UpdaterError};
pub use inflight::{InFlightRegistry, PendingProduction};
pub use keys::{CacheKey, CacheValue, ObserverId};
pub use mutation::{MutateOptions, Mutation, MutationController};
pub use query::{Producer, ProducerFuture, QueryCoordinator};
pub use retry::FailureLog;
pub use revalidate::{RevalidationBus, RevalidationCallback};
pub use scope::CacheScope;
pub use snapshot::CacheSnapshot;
pub use state::{QueryEvent, QueryState, Status};
pub use store::{CacheStore, Epoch, WriteOrigin};
pub use subscription::Subscription;
