//! Observer handle.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use super::error::ProducerError;
use super::keys::{CacheKey, CacheValue, ObserverId};
use super::lock::mutex_lock;
use super::query::{Producer, QueryCoordinator, apply};
use super::state::{QueryEvent, QueryState, Status};

const SOURCE: &str = "cache::subscription";

/// One observer's view of one key.
///
/// The state updates in place as productions settle and as the key is
/// revalidated. Dropping the subscription stops listening; it never cancels
/// a production.
pub struct Subscription<K: CacheKey, V: CacheValue> {
    key: K,
    observer: ObserverId,
    producer: Producer<V>,
    coordinator: QueryCoordinator<K, V>,
    state: Arc<watch::Sender<QueryState<V>>>,
    receiver: watch::Receiver<QueryState<V>>,
    listener: Mutex<Option<AbortHandle>>,
    registered: bool,
}

impl<K: CacheKey, V: CacheValue> Subscription<K, V> {
    pub(crate) fn new(
        key: K,
        observer: ObserverId,
        producer: Producer<V>,
        coordinator: QueryCoordinator<K, V>,
        state: Arc<watch::Sender<QueryState<V>>>,
        listener: Option<AbortHandle>,
        registered: bool,
    ) -> Self {
        let receiver = state.subscribe();
        Self {
            key,
            observer,
            producer,
            coordinator,
            state,
            receiver,
            listener: Mutex::new(listener),
            registered,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Current state.
    pub fn state(&self) -> QueryState<V> {
        self.receiver.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.receiver.borrow().status()
    }

    pub fn data(&self) -> Option<V> {
        self.receiver.borrow().data().cloned()
    }

    pub fn error(&self) -> Option<ProducerError> {
        self.receiver.borrow().error().cloned()
    }

    /// Wait for the next state change and return the new state.
    pub async fn changed(&mut self) -> QueryState<V> {
        // The sender lives in `self`, so the channel cannot close.
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }

    /// Wait until the observer holds a value or an error.
    pub async fn settled(&mut self) -> QueryState<V> {
        let settled = self
            .receiver
            .wait_for(QueryState::is_settled)
            .await
            .map(|state| state.clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Independent receiver of this observer's state, e.g. for a UI binding.
    pub fn watch(&self) -> watch::Receiver<QueryState<V>> {
        self.state.subscribe()
    }

    /// Produce the key again on this observer's behalf.
    ///
    /// Moves the observer to `Loading` and on to the production's outcome,
    /// which is also returned. Other observers of the key are revalidated if
    /// the production succeeds. A mutation landing meanwhile wins, even over a
    /// failing producer.
    pub async fn refresh(&self) -> Result<V, ProducerError> {
        apply(&self.state, QueryEvent::Initiate);

        let pending = self
            .coordinator
            .acquire_refresh(&self.key, &self.producer, Some(self.observer));

        // The listener settles the state even if this future is dropped.
        let listener = self.coordinator.listen(
            self.key.clone(),
            pending.clone(),
            Arc::clone(&self.state),
        );
        if let Some(previous) = mutex_lock(&self.listener, SOURCE, "refresh").replace(listener) {
            previous.abort();
        }

        pending.wait().await
    }
}

impl<K: CacheKey, V: CacheValue> Drop for Subscription<K, V> {
    fn drop(&mut self) {
        if let Some(listener) = mutex_lock(&self.listener, SOURCE, "drop").take() {
            listener.abort();
        }
        if self.registered {
            self.coordinator.unregister(&self.key, self.observer);
        }
        debug!(key = ?self.key, observer = %self.observer, "Subscription dropped");
    }
}

impl<K: CacheKey, V: CacheValue + fmt::Debug> fmt::Debug for Subscription<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("observer", &self.observer)
            .field("state", &*self.receiver.borrow())
            .finish_non_exhaustive()
    }
}
