//! `capture` command: one eager pass over a set of keys.
//!
//! Every key is observed once in capture mode, all productions are settled
//! and the resulting snapshot can seed an interactive scope elsewhere.

use tracing::{info, instrument, warn};

use crate::cache::{CacheConfig, CacheScope, CacheSnapshot};
use crate::config::Settings;

use super::error::AppError;
use super::workload::{Payload, SyntheticProducer};

#[instrument(skip_all, fields(keys = keys.len()))]
pub async fn run_capture(
    settings: &Settings,
    keys: &[String],
) -> Result<CacheSnapshot<String, Payload>, AppError> {
    if keys.is_empty() {
        return Err(AppError::validation("capture requires at least one key"));
    }

    let scope =
        CacheScope::<String, Payload>::new(CacheConfig::from(&settings.cache).capture());
    let workload = SyntheticProducer::from_settings(&settings.simulate);

    // Capture-mode subscriptions attach nothing; dropping them is harmless.
    for key in keys {
        drop(scope.observe_with(key.clone(), workload.producer_for(key)));
    }

    let snapshot = scope.settle_pending().await;

    let missing = keys
        .iter()
        .filter(|key| snapshot.get(key).is_none())
        .count();
    if missing > 0 {
        warn!(
            missing,
            failed = workload.failed(),
            "Some keys failed to produce and are absent from the snapshot"
        );
    }
    info!(
        entries = snapshot.len(),
        productions = workload.started(),
        "Capture complete"
    );

    Ok(snapshot)
}
