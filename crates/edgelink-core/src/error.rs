//! Shared error definitions.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while bootstrapping the agent process.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A required environment variable is missing or empty.
    #[error("required environment variable {0} is missing")]
    MissingEnv(&'static str),

    /// An environment variable holds a value outside its domain.
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}
