//! Device hostname management.

use std::sync::Arc;

use edgelink_activity::handlers::cmd::command_pair;
use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Shell, Transaction};

use crate::error::{ControlError, Result};

/// Updates the device hostname through the service CLI.
pub struct HostnameService {
    shell: Arc<dyn Shell>,
    activity: Arc<ActivityService>,
    cli: String,
}

impl HostnameService {
    /// Create the service over the CLI executable.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>, activity: Arc<ActivityService>, cli: impl Into<String>) -> Self {
        Self {
            shell,
            activity,
            cli: cli.into(),
        }
    }

    /// The current hostname.
    ///
    /// # Errors
    ///
    /// Returns an error when the hostname command fails.
    pub async fn get_hostname(&self) -> Result<String> {
        let output = self.shell.exec_output("hostname").await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }

    /// Set the hostname; rollback restores the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty hostname or a failed command.
    pub async fn update_hostname_with_tx(&self, tx: &Transaction, hostname: &str) -> Result<()> {
        if hostname.trim().is_empty() {
            return Err(ControlError::BadRequest("hostname is empty".to_string()));
        }

        let previous = self.get_hostname().await?;
        let (forward, undo) = command_pair(
            &format!("{} hostname set {hostname}", self.cli),
            &format!("{} hostname set {previous}", self.cli),
        );
        self.activity
            .execute_activity(tx, tags::EXEC_COMMAND, "update hostname", forward, undo)
            .await?;
        Ok(())
    }
}
