//! Failure bookkeeping for the retry policy.
//!
//! Remembers the last failure of each key so observers arriving inside the
//! backoff window get the previous error instead of a fresh production.

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::config::{CacheConfig, saturating_millis};
use super::error::ProducerError;
use super::keys::CacheKey;

#[derive(Debug, Clone)]
struct FailureRecord {
    consecutive: u32,
    last_failed_at: Instant,
    error: ProducerError,
}

/// Key to its most recent run of consecutive production failures.
pub struct FailureLog<K: CacheKey> {
    records: DashMap<K, FailureRecord>,
}

impl<K: CacheKey> FailureLog<K> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Record a failed production. Returns the length of the failure run.
    pub fn record(&self, key: K, error: ProducerError) -> u32 {
        let now = Instant::now();
        let mut record = self.records.entry(key).or_insert_with(|| FailureRecord {
            consecutive: 0,
            last_failed_at: now,
            error: error.clone(),
        });
        record.consecutive = record.consecutive.saturating_add(1);
        record.last_failed_at = now;
        record.error = error;
        record.consecutive
    }

    /// Forget the failure run of `key`.
    pub fn clear(&self, key: &K) {
        self.records.remove(key);
    }

    pub fn clear_all(&self) {
        self.records.clear();
    }

    /// Number of consecutive failures currently recorded for `key`.
    pub fn consecutive_failures(&self, key: &K) -> u32 {
        self.records
            .get(key)
            .map(|record| record.consecutive)
            .unwrap_or(0)
    }

    /// The last error of `key` if it is still inside its backoff window.
    pub fn suppressed(&self, key: &K, config: &CacheConfig) -> Option<ProducerError> {
        if !config.backoff_enabled() {
            return None;
        }

        let record = self.records.get(key)?;
        let window = config.failure_backoff(record.consecutive);
        let elapsed = record.last_failed_at.elapsed();
        if elapsed < window {
            debug!(
                key = ?key,
                consecutive = record.consecutive,
                window_ms = saturating_millis(window),
                elapsed_ms = saturating_millis(elapsed),
                "Key inside failure backoff window"
            );
            Some(record.error.clone())
        } else {
            None
        }
    }
}

impl<K: CacheKey> Default for FailureLog<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_until_window_elapses() {
        let log = FailureLog::<&str>::new();
        let config = CacheConfig::default();
        let error = ProducerError::msg("boom");

        assert!(log.suppressed(&"/a", &config).is_none());
        assert_eq!(log.record("/a", error.clone()), 1);

        let held = log.suppressed(&"/a", &config).expect("inside window");
        assert!(held.same_as(&error));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(log.suppressed(&"/a", &config).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(log.suppressed(&"/a", &config).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_widen_window() {
        let log = FailureLog::<&str>::new();
        let config = CacheConfig::default();

        log.record("/a", ProducerError::msg("first"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(log.record("/a", ProducerError::msg("second")), 2);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let held = log.suppressed(&"/a", &config).expect("2s window");
        assert_eq!(held.to_string(), "second");

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(log.suppressed(&"/a", &config).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_the_run() {
        let log = FailureLog::<&str>::new();
        log.record("/a", ProducerError::msg("boom"));
        log.record("/a", ProducerError::msg("boom"));
        assert_eq!(log.consecutive_failures(&"/a"), 2);

        log.clear(&"/a");

        assert_eq!(log.consecutive_failures(&"/a"), 0);
        assert!(log.suppressed(&"/a", &CacheConfig::default()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_backoff_never_suppresses() {
        let log = FailureLog::<&str>::new();
        log.record("/a", ProducerError::msg("boom"));

        assert!(
            log.suppressed(&"/a", &CacheConfig::without_backoff())
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_tracked_independently() {
        let log = FailureLog::<&str>::new();
        let config = CacheConfig::default();
        log.record("/a", ProducerError::msg("boom"));

        assert!(log.suppressed(&"/a", &config).is_some());
        assert!(log.suppressed(&"/b", &config).is_none());

        log.clear_all();
        assert!(log.suppressed(&"/a", &config).is_none());
    }
}
