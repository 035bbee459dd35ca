//! Error types for the configuration service.

use thiserror::Error;

/// A result type using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while reading or updating device configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A rule generator rejected the update.
    #[error("generator {name}: {message}")]
    Generator {
        /// Generator name.
        name: &'static str,
        /// Failure description.
        message: String,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] edgelink_store::StoreError),

    /// Activity engine error.
    #[error(transparent)]
    Activity(#[from] edgelink_activity::ActivityError),
}
