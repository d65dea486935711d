//! Per-observer query state machine.
//!
//! `None -> Loading -> {Success, Error}`, and back to `Loading` whenever a
//! fresh production is started for an observer that already settled.

use serde::Serialize;

use super::error::ProducerError;

/// Coarse status of a [`QueryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    None,
    Loading,
    Success,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// State held by one observer of one key.
///
/// Data and error are carried by the variants, so a successful state can
/// never carry an error and a failed state can never carry data.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<V> {
    None,
    Loading,
    Success(V),
    Error(ProducerError),
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self::None
    }
}

/// Inputs to [`QueryState::transition`].
#[derive(Debug, Clone)]
pub enum QueryEvent<V> {
    /// A production was started or joined on the observer's behalf.
    Initiate,
    /// The production the observer waited on delivered a value.
    Resolved(V),
    /// The production the observer waited on failed.
    Rejected(ProducerError),
    /// The key was written elsewhere and the observer re-read the cache.
    Revalidated(V),
}

impl<V> QueryState<V> {
    /// Pure transition function.
    ///
    /// Every event is accepted from every state: revalidation may deliver a
    /// value while a production is still loading, and a refresh may restart a
    /// settled observer.
    #[must_use]
    pub fn transition(self, event: QueryEvent<V>) -> Self {
        match event {
            QueryEvent::Initiate => Self::Loading,
            QueryEvent::Resolved(value) | QueryEvent::Revalidated(value) => Self::Success(value),
            QueryEvent::Rejected(error) => Self::Error(error),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::None => Status::None,
            Self::Loading => Status::Loading,
            Self::Success(_) => Status::Success,
            Self::Error(_) => Status::Error,
        }
    }

    pub fn data(&self) -> Option<&V> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ProducerError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    /// True once the observer holds either a value or an error.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error(_))
    }
}
