//! Error types for the message-bus adapter.

use thiserror::Error;

/// A result type using `MqError`.
pub type Result<T> = std::result::Result<T, MqError>;

/// Errors that can occur on the message bus.
#[derive(Debug, Error)]
pub enum MqError {
    /// No consumer is listening on the subject.
    #[error("no responder on subject {0}")]
    NoResponder(String),

    /// The subject already has a consumer.
    #[error("subject {0} already subscribed")]
    AlreadySubscribed(String),

    /// No handler was registered for the subject.
    #[error("no handler registered for subject {0}")]
    HandlerNotRegistered(String),

    /// The handler is already active.
    #[error("handler for subject {0} already active")]
    AlreadyActive(String),

    /// The handler is not active.
    #[error("handler for subject {0} not active")]
    NotActive(String),

    /// The request timed out waiting for a reply.
    #[error("request on subject {0} timed out")]
    Timeout(String),

    /// The reply channel was dropped before a response was sent.
    #[error("no reply on subject {0}")]
    NoReply(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MqError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
