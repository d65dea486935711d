//! Failures surfaced by producers and updaters.
//!
//! Both error types are opaque and cheap to clone: one production failure is
//! delivered verbatim to every observer that was waiting on it.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

type Cause = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// A producer's asynchronous operation failed (or panicked).
///
/// Two `ProducerError`s compare equal when they wrap the same underlying
/// failure, which is how observers coalesced onto one production can tell
/// they received the identical error.
#[derive(Clone)]
pub struct ProducerError {
    cause: Cause,
}

impl ProducerError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            cause: Arc::new(error),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn panicked(payload: &(dyn Any + Send)) -> Self {
        Self::msg(format!("producer panicked: {}", panic_message(payload)))
    }

    pub(crate) fn abandoned() -> Self {
        Self::msg("production ended without delivering a result")
    }

    /// Attempt to view the wrapped failure as a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.cause.downcast_ref::<E>()
    }

    /// Returns true if both handles wrap the same failure.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.cause, f)
    }
}

impl fmt::Debug for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProducerError").field(&self.cause).finish()
    }
}

impl StdError for ProducerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.source()
    }
}

impl PartialEq for ProducerError {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// A mutation's updater failed. Nothing was written.
#[derive(Clone)]
pub struct UpdaterError {
    cause: Cause,
}

impl UpdaterError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            cause: Arc::new(error),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.cause.downcast_ref::<E>()
    }
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.cause, f)
    }
}

impl fmt::Debug for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpdaterError").field(&self.cause).finish()
    }
}

impl StdError for UpdaterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.source()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream returned {status}")]
    struct Upstream {
        status: u16,
    }

    #[test]
    fn display_passes_through_verbatim() {
        let error = ProducerError::new(Upstream { status: 503 });
        assert_eq!(error.to_string(), "upstream returned 503");

        let error = UpdaterError::msg("rejected by server");
        assert_eq!(error.to_string(), "rejected by server");
    }

    #[test]
    fn downcast_recovers_concrete_error() {
        let error = ProducerError::new(Upstream { status: 404 });
        let upstream = error.downcast_ref::<Upstream>().expect("upstream error");
        assert_eq!(upstream.status, 404);
        assert!(error.downcast_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn clones_are_identical_but_equal_messages_are_not() {
        let first = ProducerError::msg("boom");
        let clone = first.clone();
        let other = ProducerError::msg("boom");

        assert_eq!(first, clone);
        assert!(first.same_as(&clone));
        assert_ne!(first, other);
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn Any + Send> = Box::new("exploded");
        assert_eq!(
            ProducerError::panicked(payload.as_ref()).to_string(),
            "producer panicked: exploded"
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(
            ProducerError::panicked(payload.as_ref()).to_string(),
            "producer panicked: owned"
        );

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert!(
            ProducerError::panicked(payload.as_ref())
                .to_string()
                .contains("non-string")
        );
    }
}
