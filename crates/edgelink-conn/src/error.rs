//! Error types for the connection supervisor.

use thiserror::Error;

/// A result type using `ConnError`.
pub type Result<T> = std::result::Result<T, ConnError>;

/// Errors that can occur in discovery and websocket operations.
#[derive(Debug, Error)]
pub enum ConnError {
    /// More than one orchestrator claims the primary role.
    #[error("split-brain: multiple primary orchestrators")]
    SplitBrain,

    /// No orchestrator claims the primary role.
    #[error("primary not found")]
    PrimaryNotFound,

    /// A discovery probe returned an error status.
    #[error("api error: {host} returned status {status}")]
    Api {
        /// Probed host.
        host: String,
        /// HTTP status code.
        status: u16,
    },

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(String),

    /// The websocket is not connected.
    #[error("websocket not active")]
    NotActive,

    /// The publisher is already started.
    #[error("publisher already started")]
    AlreadyStarted,

    /// The publisher is already stopped.
    #[error("publisher already stopped")]
    AlreadyStopped,

    /// The request deadline passed without a response.
    #[error("request {0} timed out")]
    Timeout(String),

    /// The connection dropped while a request was in flight.
    #[error("connection closed")]
    Closed,

    /// Required configuration is missing.
    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    /// Websocket protocol failure.
    #[error("websocket error: {0}")]
    Websocket(String),

    /// Configuration service failure.
    #[error(transparent)]
    Config(#[from] edgelink_config::ConfigError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ConnError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
