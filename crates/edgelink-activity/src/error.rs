//! Error types for the activity engine.

use thiserror::Error;

/// A result type using `ActivityError`.
pub type Result<T> = std::result::Result<T, ActivityError>;

/// Errors that can occur while executing or rolling back activities.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// No handler is registered for the activity type.
    #[error("unknown activity type: {0}")]
    UnknownActivity(String),

    /// Two handlers claim the same activity type.
    #[error("duplicate activity handler: {0}")]
    DuplicateHandler(String),

    /// A handler failed to decode its payload.
    #[error("activity {activity}: payload decode error: {message}")]
    Payload {
        /// Activity type tag.
        activity: String,
        /// Decode failure description.
        message: String,
    },

    /// A handler's forward or undo action failed.
    #[error("activity {activity} ({name}): {message}")]
    Exec {
        /// Activity type tag.
        activity: String,
        /// Human-readable step name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// A shell command exited unsuccessfully.
    #[error("command {command:?} failed: {message}")]
    Command {
        /// The command line.
        command: String,
        /// Exit status or spawn failure.
        message: String,
    },

    /// An inline (non-durable) step failed.
    #[error("inline step failed: {0}")]
    Inline(String),

    /// The referenced checkpoint does not exist.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// The transaction was already finished.
    #[error("transaction {0} already finished")]
    Finished(String),

    /// Rollback stopped early under the abort-on-fail strategy.
    #[error("rollback aborted at step {step:?}: {message}")]
    RollbackAborted {
        /// Name of the step whose undo failed.
        step: String,
        /// Undo failure description.
        message: String,
    },

    /// Journal record decode failure.
    #[error("journal decode error: {0}")]
    Journal(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] edgelink_store::StoreError),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
