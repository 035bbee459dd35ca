//! Coordination with the update-manager sidecar over the bus.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use edgelink_core::consts::mq;
use edgelink_mq::{MqResponse, MqService};

use edgelink_activity::Shell;

use crate::error::{ControlError, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const GET_VERSIONS_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One package of an install request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageItem {
    /// Package name.
    pub name: String,
    /// Version to install.
    #[serde(default)]
    pub version: String,
    /// Version currently installed.
    #[serde(default)]
    pub previous_version: String,
}

/// The install request as the orchestrator sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallPackageRequest {
    /// Packages to install.
    #[serde(default)]
    pub packages_to_install: Vec<PackageItem>,
}

impl InstallPackageRequest {
    /// True when the request includes the named package.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages_to_install.iter().any(|item| item.name == name)
    }
}

/// Client of the update-manager sidecar.
pub struct UpdateManagerService {
    mq: Arc<MqService>,
    shell: Arc<dyn Shell>,
    cli: String,
}

impl UpdateManagerService {
    /// Create the client.
    #[must_use]
    pub fn new(mq: Arc<MqService>, shell: Arc<dyn Shell>, cli: impl Into<String>) -> Self {
        Self {
            mq,
            shell,
            cli: cli.into(),
        }
    }

    /// Ask the update manager to download packages.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an error reply.
    pub async fn download(&self, request: &Value) -> Result<()> {
        let response: MqResponse = self
            .mq
            .request(mq::UPDATE_MANAGER_DOWNLOAD, request, DOWNLOAD_TIMEOUT)
            .await?;
        if response.is_error() {
            return Err(ControlError::Internal(response.error()));
        }
        Ok(())
    }

    /// Ask the update manager for installed package versions.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an error reply.
    pub async fn get_versions(&self) -> Result<MqResponse> {
        let response: MqResponse = self
            .mq
            .request(
                mq::UPDATE_MANAGER_GET_VERSIONS,
                &Value::Null,
                GET_VERSIONS_TIMEOUT,
            )
            .await?;
        if response.is_error() {
            return Err(ControlError::Internal(response.error()));
        }
        Ok(response)
    }

    /// Submit an install request; completion arrives separately on
    /// `agent.install_finished`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an error reply.
    pub async fn install(&self, request: &InstallPackageRequest) -> Result<()> {
        let response: MqResponse = self
            .mq
            .request(mq::UPDATE_MANAGER_INSTALL, request, INSTALL_REQUEST_TIMEOUT)
            .await?;
        if response.is_error() {
            return Err(ControlError::Internal(response.error()));
        }
        Ok(())
    }

    /// Point the update manager at a package source.
    ///
    /// # Errors
    ///
    /// Returns an error when the CLI command fails.
    pub async fn set_apt_source(&self, apt_source: &str) -> Result<()> {
        if apt_source.is_empty() {
            return Ok(());
        }
        self.shell
            .exec(&format!("{} apt set-source {apt_source}", self.cli))
            .await?;
        Ok(())
    }
}
