//! Error types for the agent core.

use edgelink_core::AppState;
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors raised by the app-state controller and the state handlers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The controller is already in the requested state.
    #[error("already in state {0}")]
    AlreadyInState(AppState),

    /// No handler is registered for the destination state.
    #[error("handler for state {0} not found")]
    HandlerMissing(AppState),

    /// Two handlers claim the same state.
    #[error("duplicate handler for state {0}")]
    DuplicateHandler(AppState),

    /// The destination handler rejects transitions from the current state.
    #[error("transition from {from} to {to} not supported")]
    TransitionNotSupported {
        /// Current state.
        from: AppState,
        /// Requested state.
        to: AppState,
    },

    /// The handler does not understand the transition variant.
    #[error("invalid transition type {transition} for state {state}")]
    InvalidTransitionType {
        /// Destination state.
        state: AppState,
        /// Transition tag.
        transition: &'static str,
    },

    /// The request payload failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The orchestrator did not finish device init in time.
    #[error("device init timeout")]
    DeviceInitTimeout,

    /// The update manager did not report install completion in time.
    #[error("install timeout")]
    InstallTimeout,

    /// No hub tunnel answered within the deadline.
    #[error("all tunnels down")]
    TunnelsDown,

    /// The controller loop is gone.
    #[error("state controller closed")]
    ControllerClosed,

    /// Activity engine failure.
    #[error(transparent)]
    Activity(#[from] edgelink_activity::ActivityError),

    /// Configuration service failure.
    #[error(transparent)]
    Config(#[from] edgelink_config::ConfigError),

    /// Storage failure.
    #[error("storage error: {0}")]
    Store(#[from] edgelink_store::StoreError),

    /// Connection supervisor failure.
    #[error(transparent)]
    Conn(#[from] edgelink_conn::ConnError),

    /// Message-bus failure.
    #[error(transparent)]
    Mq(#[from] edgelink_mq::MqError),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ControlError {
    /// True for errors callers should surface as `bad-request`.
    #[must_use]
    pub const fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInState(_)
                | Self::TransitionNotSupported { .. }
                | Self::InvalidTransitionType { .. }
                | Self::BadRequest(_)
        )
    }
}
