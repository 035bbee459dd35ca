//! Activity handlers.
//!
//! A handler owns one activity type: a stable string tag, a forward action
//! and an undo action, both driven by serializable payloads. Handlers that
//! touch files or external processes must assume the forward action may have
//! crashed mid-way; the undo payload must stay runnable against any partial
//! forward state.

pub mod cmd;
pub mod file;

pub use cmd::{ExecCommandHandler, ExecCommandsHandler};
pub use file::{UpdateFileHandler, WriteFileHandler};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A registered effector for one activity type.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// The stable tag this handler is registered under.
    fn activity_type(&self) -> &'static str;

    /// Apply the forward payload.
    async fn forward(&self, payload: &Value) -> Result<()>;

    /// Apply the undo payload.
    async fn undo(&self, payload: &Value) -> Result<()>;
}

/// Activity type tags of the built-in handlers.
pub mod tags {
    /// Single forward/undo command pair.
    pub const EXEC_COMMAND: &str = "exec_command";
    /// Ordered command lists.
    pub const EXEC_COMMANDS: &str = "exec_commands";
    /// Create a file (undo removes it).
    pub const WRITE_FILE: &str = "write_file";
    /// Replace file contents (undo restores the previous bytes).
    pub const UPDATE_FILE: &str = "update_file";
    /// Write config sections to the embedded store.
    pub const UPDATE_STORE_SECTION: &str = "update_store_section";
}
