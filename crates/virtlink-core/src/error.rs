//! Error types.
//!
//! Two groups live in [`Error`]:
//!
//! - **Invariant violations** (`NotConnected`, `ConnectionLost`,
//!   `DuplicateSubscriber`, `NotSubscribed`, `SubscriberLeak`) are checked
//!   eagerly on the dispatch context and returned to the immediate caller.
//!   They are never retried.
//! - **Work failures** (`Backend`, `Cancelled`, `WorkerPanicked`, `Io`) come back
//!   from worker threads through the failable job runner's error callback.

use thiserror::Error;

use crate::model::SubscriptionId;

/// Failure reported by the backend library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct BackendError {
    pub operation: String,
    pub message: String,
}

impl BackendError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection {url} is not connected")]
    NotConnected { url: String },

    #[error("connection {url} was lost")]
    ConnectionLost { url: String },

    #[error("connection {url} has been deleted")]
    Deleted { url: String },

    #[error("subscriber '{label}' is already registered")]
    DuplicateSubscriber { label: String },

    #[error("{0} is not registered")]
    NotSubscribed(SubscriptionId),

    #[error("{owner} still has subscribers: {labels:?}")]
    SubscriberLeak { owner: String, labels: Vec<String> },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::NotConnected { .. } => "not_connected",
            Error::ConnectionLost { .. } => "connection_lost",
            Error::Deleted { .. } => "deleted",
            Error::DuplicateSubscriber { .. } => "duplicate_subscriber",
            Error::NotSubscribed(_) => "not_subscribed",
            Error::SubscriberLeak { .. } => "subscriber_leak",
            Error::Backend(_) => "backend",
            Error::Cancelled => "cancelled",
            Error::WorkerPanicked(_) => "worker_panicked",
            Error::Settings(_) => "settings",
            Error::Io(_) => "io",
        }
    }

    /// Subscription-lifecycle bugs rather than runtime conditions.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSubscriber { .. } | Error::NotSubscribed(_) | Error::SubscriberLeak { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_converts() {
        let err: Error = BackendError::new("open", "refused").into();
        assert_eq!(err.as_label(), "backend");
        assert_eq!(err.to_string(), "open failed: refused");
        assert!(!err.is_programmer_error());
    }

    #[test]
    fn leak_names_the_offenders() {
        let err = Error::SubscriberLeak {
            owner: "domain u1".into(),
            labels: vec!["details-view".into()],
        };
        assert!(err.is_programmer_error());
        assert!(err.to_string().contains("details-view"));
    }
}
