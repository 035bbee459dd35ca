//! Command-pair activity handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActivityError, Result};
use crate::handlers::{tags, ActivityHandler};
use crate::shell::Shell;

/// Payload of a single command half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// The command line.
    pub command: String,
}

/// Payload of an ordered command-list half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsPayload {
    /// Command lines, run in order.
    pub commands: Vec<String>,
}

/// Build the `(forward, undo)` payload pair for a command-pair activity.
#[must_use]
pub fn command_pair(forward: &str, undo: &str) -> (Value, Value) {
    (
        serde_json::json!({ "command": forward }),
        serde_json::json!({ "command": undo }),
    )
}

/// Runs one shell command per payload half.
pub struct ExecCommandHandler {
    shell: Arc<dyn Shell>,
}

impl ExecCommandHandler {
    /// Create the handler over a shell.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }

    async fn run(&self, payload: &Value) -> Result<()> {
        let payload: CommandPayload =
            serde_json::from_value(payload.clone()).map_err(|e| ActivityError::Payload {
                activity: tags::EXEC_COMMAND.to_string(),
                message: e.to_string(),
            })?;

        self.shell.exec(&payload.command).await
    }
}

#[async_trait]
impl ActivityHandler for ExecCommandHandler {
    fn activity_type(&self) -> &'static str {
        tags::EXEC_COMMAND
    }

    async fn forward(&self, payload: &Value) -> Result<()> {
        self.run(payload).await
    }

    async fn undo(&self, payload: &Value) -> Result<()> {
        self.run(payload).await
    }
}

/// Runs an ordered list of shell commands per payload half.
pub struct ExecCommandsHandler {
    shell: Arc<dyn Shell>,
}

impl ExecCommandsHandler {
    /// Create the handler over a shell.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }

    async fn run(&self, payload: &Value) -> Result<()> {
        let payload: CommandsPayload =
            serde_json::from_value(payload.clone()).map_err(|e| ActivityError::Payload {
                activity: tags::EXEC_COMMANDS.to_string(),
                message: e.to_string(),
            })?;

        for command in &payload.commands {
            self.shell.exec(command).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for ExecCommandsHandler {
    fn activity_type(&self) -> &'static str {
        tags::EXEC_COMMANDS
    }

    async fn forward(&self, payload: &Value) -> Result<()> {
        self.run(payload).await
    }

    async fn undo(&self, payload: &Value) -> Result<()> {
        self.run(payload).await
    }
}
