//! `simulate` command: concurrent observers, one mutation per key.

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::cache::{
    CacheConfig, CacheScope, CacheSnapshot, QueryState, Subscription, saturating_millis,
};
use crate::config::Settings;

use super::error::AppError;
use super::workload::{Payload, SyntheticProducer};

/// Outcome of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub keys: usize,
    pub observers: usize,
    pub productions_started: u64,
    pub production_failures: u64,
    pub observers_succeeded: usize,
    pub observers_failed: usize,
    pub mutations: usize,
    pub observers_revalidated: usize,
    pub elapsed_ms: u64,
    pub snapshot: CacheSnapshot<String, Payload>,
}

/// Observe every configured key from many observers at once, then mutate each
/// key and check that every observer converged on the mutated value.
#[instrument(skip_all, fields(keys = settings.simulate.keys.len()))]
pub async fn run_simulation(settings: &Settings) -> Result<SimulationReport, AppError> {
    let clock = Instant::now();
    let simulate = &settings.simulate;
    let scope = CacheScope::<String, Payload>::new(CacheConfig::from(&settings.cache));
    let workload = SyntheticProducer::from_settings(simulate);

    let mut subscriptions: Vec<Subscription<String, Payload>> = Vec::new();
    for key in &simulate.keys {
        let producer = workload.producer_for(key);
        for _ in 0..simulate.observers.get() {
            subscriptions.push(scope.observe_with(key.clone(), producer.clone()));
        }
    }
    info!(
        observers = subscriptions.len(),
        in_flight = scope.in_flight(),
        "Observers attached"
    );

    let settled = join_all(
        subscriptions
            .iter_mut()
            .map(|subscription| subscription.settled()),
    )
    .await;
    let observers_succeeded = settled
        .iter()
        .filter(|state| matches!(state, QueryState::Success(_)))
        .count();
    let observers_failed = settled.len() - observers_succeeded;

    let mut mutations = 0;
    for key in &simulate.keys {
        let key_for_update = key.clone();
        let written = scope
            .mutation(key.clone())
            .update(move |previous| Some(Payload::revised(&key_for_update, previous)))
            .await;
        if written.is_some() {
            mutations += 1;
        }
    }

    let observers_revalidated = subscriptions
        .iter()
        .filter(|subscription| {
            let current = scope.peek(subscription.key());
            current.is_some() && subscription.data() == current
        })
        .count();

    if observers_revalidated != subscriptions.len() {
        return Err(AppError::unexpected(format!(
            "{} of {} observers did not converge after mutation",
            subscriptions.len() - observers_revalidated,
            subscriptions.len()
        )));
    }

    let report = SimulationReport {
        keys: simulate.keys.len(),
        observers: subscriptions.len(),
        productions_started: workload.started(),
        production_failures: workload.failed(),
        observers_succeeded,
        observers_failed,
        mutations,
        observers_revalidated,
        elapsed_ms: saturating_millis(clock.elapsed()),
        snapshot: scope.cache_snapshot(),
    };

    info!(
        productions_started = report.productions_started,
        production_failures = report.production_failures,
        observers_revalidated = report.observers_revalidated,
        elapsed_ms = report.elapsed_ms,
        "Simulation complete"
    );

    Ok(report)
}
