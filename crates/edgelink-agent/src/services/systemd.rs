//! Systemd unit control through the activity engine.

use std::sync::Arc;

use edgelink_activity::handlers::cmd::command_pair;
use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Shell, Transaction};

use crate::error::Result;

fn start_cmd(unit: &str) -> String {
    format!("systemctl start {unit}")
}

fn stop_cmd(unit: &str) -> String {
    format!("systemctl stop {unit}")
}

fn enable_cmd(unit: &str) -> String {
    format!("systemctl enable {unit}")
}

fn disable_cmd(unit: &str) -> String {
    format!("systemctl disable {unit}")
}

/// Drives systemd units; transactional variants journal the inverse command.
pub struct SystemdService {
    shell: Arc<dyn Shell>,
    activity: Arc<ActivityService>,
}

impl SystemdService {
    /// Create the service.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>, activity: Arc<ActivityService>) -> Self {
        Self { shell, activity }
    }

    /// Start a unit; rollback stops it.
    ///
    /// # Errors
    ///
    /// Returns an error when the command or journal write fails.
    pub async fn try_start_with_tx(&self, tx: &Transaction, unit: &str) -> Result<()> {
        let (forward, undo) = command_pair(&start_cmd(unit), &stop_cmd(unit));
        self.activity
            .execute_activity(tx, tags::EXEC_COMMAND, &format!("start {unit}"), forward, undo)
            .await?;
        Ok(())
    }

    /// Stop a unit; rollback starts it.
    ///
    /// # Errors
    ///
    /// Returns an error when the command or journal write fails.
    pub async fn try_stop_with_tx(&self, tx: &Transaction, unit: &str) -> Result<()> {
        let (forward, undo) = command_pair(&stop_cmd(unit), &start_cmd(unit));
        self.activity
            .execute_activity(tx, tags::EXEC_COMMAND, &format!("stop {unit}"), forward, undo)
            .await?;
        Ok(())
    }

    /// Enable a unit; rollback disables it.
    ///
    /// # Errors
    ///
    /// Returns an error when the command or journal write fails.
    pub async fn enable_with_tx(&self, tx: &Transaction, unit: &str) -> Result<()> {
        let (forward, undo) = command_pair(&enable_cmd(unit), &disable_cmd(unit));
        self.activity
            .execute_activity(tx, tags::EXEC_COMMAND, &format!("enable {unit}"), forward, undo)
            .await?;
        Ok(())
    }

    /// Stop a unit outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns an error when the command fails.
    pub async fn try_stop(&self, unit: &str) -> Result<()> {
        self.shell.exec(&stop_cmd(unit)).await?;
        Ok(())
    }

    /// Disable then stop a unit outside any transaction, logging failures.
    pub async fn disable_and_stop_logged(&self, unit: &str) {
        if let Err(e) = self.shell.exec(&disable_cmd(unit)).await {
            tracing::error!(unit, error = %e, "disable service failed");
        }
        if let Err(e) = self.shell.exec(&stop_cmd(unit)).await {
            tracing::error!(unit, error = %e, "stop service failed");
        }
    }
}
