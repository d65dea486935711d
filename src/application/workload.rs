//! Synthetic workload driven by the command-line host.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::{Producer, ProducerError};
use crate::config::SimulateSettings;

/// Value cached by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub key: String,
    /// Bumped by every mutation.
    pub revision: u64,
    /// Sequence number of the production that created the payload; `None`
    /// when a mutation created it.
    pub production: Option<u64>,
}

impl Payload {
    /// Next revision of `previous`, or a fresh payload for `key`.
    pub fn revised(key: &str, previous: Option<Payload>) -> Payload {
        match previous {
            Some(previous) => Payload {
                revision: previous.revision + 1,
                ..previous
            },
            None => Payload {
                key: key.to_string(),
                revision: 1,
                production: None,
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("synthetic failure of production {production} for `{key}`")]
pub struct SyntheticFailure {
    pub key: String,
    pub production: u64,
}

/// Producer factory with a fixed latency and a deterministic failure period.
#[derive(Debug, Clone)]
pub struct SyntheticProducer {
    delay: Duration,
    failure_every: Option<NonZeroU32>,
    started: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl SyntheticProducer {
    pub fn new(delay: Duration, failure_every: Option<NonZeroU32>) -> Self {
        Self {
            delay,
            failure_every,
            started: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_settings(settings: &SimulateSettings) -> Self {
        Self::new(settings.producer_delay, settings.failure_every)
    }

    /// Producer for `key`. Every production draws the next global sequence
    /// number; multiples of the failure period fail.
    pub fn producer_for(&self, key: &str) -> Producer<Payload> {
        let key = key.to_string();
        let delay = self.delay;
        let failure_every = self.failure_every;
        let started = Arc::clone(&self.started);
        let failed = Arc::clone(&self.failed);

        Producer::new(move || {
            let production = started.fetch_add(1, Ordering::SeqCst) + 1;
            let key = key.clone();
            let failed = Arc::clone(&failed);
            async move {
                debug!(key = %key, production, "Synthetic production running");
                tokio::time::sleep(delay).await;

                let fails = failure_every
                    .is_some_and(|every| production % u64::from(every.get()) == 0);
                if fails {
                    failed.fetch_add(1, Ordering::SeqCst);
                    return Err(ProducerError::new(SyntheticFailure { key, production }));
                }

                Ok(Payload {
                    key,
                    revision: 0,
                    production: Some(production),
                })
            }
        })
    }

    /// Number of times any producer of this factory was invoked.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}
