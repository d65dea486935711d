//! Cache configuration.
//!
//! Controls the execution mode of a scope and its failure backoff via the
//! `[cache]` section of `stampede.toml`.

use std::time::Duration;

use serde::Deserialize;

/// Default backoff after the first consecutive failure of a key.
pub const DEFAULT_FAILURE_BACKOFF_BASE_MS: u64 = 1_000;
/// Default upper bound of the failure backoff.
pub const DEFAULT_FAILURE_BACKOFF_MAX_MS: u64 = 30_000;
// 2^20 * base already dwarfs any sane cap.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// Whether observers run the normal asynchronous flow or a one-shot capture
/// pass whose productions are awaited by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Interactive,
    Capture,
}

/// Per-scope cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Execution mode of the scope.
    pub mode: ExecutionMode,
    /// Backoff after the first consecutive failure of a key; zero disables
    /// backoff entirely.
    pub failure_backoff_base_ms: u64,
    /// Upper bound for the doubled backoff.
    pub failure_backoff_max_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Interactive,
            failure_backoff_base_ms: DEFAULT_FAILURE_BACKOFF_BASE_MS,
            failure_backoff_max_ms: DEFAULT_FAILURE_BACKOFF_MAX_MS,
        }
    }
}

/// Whole milliseconds of `duration`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            mode: ExecutionMode::Interactive,
            failure_backoff_base_ms: saturating_millis(settings.failure_backoff_base),
            failure_backoff_max_ms: saturating_millis(settings.failure_backoff_max),
        }
    }
}

impl CacheConfig {
    /// Same configuration, switched to capture mode.
    #[must_use]
    pub fn capture(mut self) -> Self {
        self.mode = ExecutionMode::Capture;
        self
    }

    /// Configuration that retries a failed key on the very next observation.
    pub fn without_backoff() -> Self {
        Self {
            failure_backoff_base_ms: 0,
            ..Default::default()
        }
    }

    pub fn is_capture(&self) -> bool {
        self.mode == ExecutionMode::Capture
    }

    /// Returns true if failed keys are held back before being produced again.
    pub fn backoff_enabled(&self) -> bool {
        self.failure_backoff_base_ms > 0
    }

    /// Backoff window after `consecutive_failures` failures in a row.
    ///
    /// `min(base * 2^(n-1), max)`; zero when backoff is disabled or nothing
    /// has failed yet.
    pub fn failure_backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 || !self.backoff_enabled() {
            return Duration::ZERO;
        }

        let shift = (consecutive_failures - 1).min(MAX_BACKOFF_SHIFT);
        let millis = self
            .failure_backoff_base_ms
            .saturating_mul(1_u64 << shift)
            .min(self.failure_backoff_max_ms);
        Duration::from_millis(millis)
    }
}
