//! Shell command execution behind a mockable trait.

use async_trait::async_trait;

use crate::error::{ActivityError, Result};

/// Runs shell command lines.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Execute a command, discarding its output.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be spawned or exits
    /// unsuccessfully.
    async fn exec(&self, command: &str) -> Result<()>;

    /// Execute a command and return its combined output.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be spawned or exits
    /// unsuccessfully.
    async fn exec_output(&self, command: &str) -> Result<Vec<u8>>;
}

/// `/bin/sh`-backed shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl SystemShell {
    /// Create a new system shell.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Shell for SystemShell {
    async fn exec(&self, command: &str) -> Result<()> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ActivityError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ActivityError::Command {
                command: command.to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(())
    }

    async fn exec_output(&self, command: &str) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ActivityError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ActivityError::Command {
                command: command.to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(output.stdout)
    }
}
