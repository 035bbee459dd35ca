//! The `maintenance` state: installing device packages.
//!
//! Installs run through the update-manager sidecar. When the agent package
//! itself is in the set, a checkpoint seals the preparation steps before the
//! install request goes out: the install restarts the agent process, and the
//! next boot must not undo what the new agent depends on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use edgelink_activity::{ActivityService, Shell, Transaction};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_conn::{Publisher, RequestOptions};
use edgelink_core::consts::{mq, packages, ws};
use edgelink_core::{AppState, Transition};
use edgelink_mq::MqService;
use edgelink_store::{DeviceConfig, ObjectsSection};

use crate::error::{ControlError, Result};
use crate::handlers::StateHandler;
use crate::services::update_manager::{InstallPackageRequest, UpdateManagerService};

const INSTALL_FINISHED_TIMEOUT: Duration = Duration::from_secs(30);
const FINISH_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);
const INSTALL_UPDATE_MANAGER_CMD: &str = "/usr/lib/sdwan/install-update-manager.sh";

#[derive(Debug, Deserialize)]
struct InstallFinishedBody {
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

/// Handler of the `maintenance` state.
pub struct MaintenanceStateHandler {
    mq: Arc<MqService>,
    config: Arc<ConfigService>,
    publisher: Arc<Publisher>,
    update_manager: Arc<UpdateManagerService>,
    activity: Arc<ActivityService>,
    shell: Arc<dyn Shell>,
    install_timeout: Duration,
}

impl MaintenanceStateHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        mq: Arc<MqService>,
        config: Arc<ConfigService>,
        publisher: Arc<Publisher>,
        update_manager: Arc<UpdateManagerService>,
        activity: Arc<ActivityService>,
        shell: Arc<dyn Shell>,
    ) -> Self {
        Self {
            mq,
            config,
            publisher,
            update_manager,
            activity,
            shell,
            install_timeout: INSTALL_FINISHED_TIMEOUT,
        }
    }

    /// Override the install-finished deadline.
    #[must_use]
    pub const fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    /// The update manager cannot replace itself through the bus; install it
    /// directly and strip it from the request.
    async fn install_update_manager(
        &self,
        mut request: InstallPackageRequest,
    ) -> Result<InstallPackageRequest> {
        let package = request
            .packages_to_install
            .iter()
            .find(|item| item.name == packages::UPDATE_MANAGER)
            .cloned();

        if let Some(package) = package {
            self.shell
                .exec(&format!(
                    "{INSTALL_UPDATE_MANAGER_CMD} {} {}",
                    package.version, package.previous_version
                ))
                .await?;

            request
                .packages_to_install
                .retain(|item| item.name != packages::UPDATE_MANAGER);
        }

        Ok(request)
    }

    async fn update_device(
        &self,
        tx: &Arc<Transaction>,
        request: InstallPackageRequest,
    ) -> Result<()> {
        let request = self.install_update_manager(request).await?;
        if request.packages_to_install.is_empty() {
            return Ok(());
        }

        let replaces_core_daemon = request.contains(packages::AGENT)
            || request.contains(packages::BGP_ADAPTER)
            || request.contains(packages::BGPD);
        if replaces_core_daemon {
            self.delete_services(tx).await?;
        }

        let checkpoint = if request.contains(packages::AGENT) {
            // the install restarts this process; everything up to here is
            // committed even if we never come back
            Some(self.activity.add_checkpoint(tx)?)
        } else {
            None
        };

        let result = self.run_install(&request).await;
        if result.is_err() {
            if let Some(checkpoint) = &checkpoint {
                // the committed action never became observable
                if let Err(e) = self.activity.delete_checkpoint(tx, checkpoint) {
                    tracing::error!(error = %e, "cleanup checkpoint failed");
                }
            }
        }
        result
    }

    async fn run_install(&self, request: &InstallPackageRequest) -> Result<()> {
        self.update_manager.install(request).await?;
        self.wait_install_finished().await
    }

    /// Tear the service objects down before their daemons are replaced.
    async fn delete_services(&self, tx: &Arc<Transaction>) -> Result<()> {
        let empty = DeviceConfig {
            trunk: Some(ObjectsSection::default()),
            p2p: Some(ObjectsSection::default()),
            bridge: Some(ObjectsSection::default()),
            isb: Some(ObjectsSection::default()),
            l3: Some(ObjectsSection::default()),
            fw: Some(ObjectsSection::default()),
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &empty, UpdateOptions::default())
            .await?;
        Ok(())
    }

    async fn wait_install_finished(&self) -> Result<()> {
        let mut finished = self.mq.chan_subscribe(mq::AGENT_INSTALL_FINISHED)?;

        let outcome = tokio::time::timeout(self.install_timeout, finished.recv()).await;
        if let Err(e) = self.mq.chan_unsubscribe(mq::AGENT_INSTALL_FINISHED) {
            tracing::error!(error = %e, "drop install-finished subscription failed");
        }

        match outcome {
            Ok(Some(mut message)) => {
                message.respond(Vec::new());

                let body: InstallFinishedBody = serde_json::from_slice(&message.payload)
                    .map_err(|e| ControlError::Internal(e.to_string()))?;
                if body.error_message.is_empty() {
                    Ok(())
                } else {
                    Err(ControlError::Internal(body.error_message))
                }
            }
            Ok(None) => Err(ControlError::InstallTimeout),
            Err(_) => Err(ControlError::InstallTimeout),
        }
    }

    /// After a restart in `maintenance` the install is still running: bring
    /// the publisher up and wait for the sidecar's completion notice.
    async fn wait_install_finished_after_boot(&self) -> Result<()> {
        self.publisher.start()?;
        self.wait_install_finished().await
    }

    /// Report the install outcome to the orchestrator, then force a fresh
    /// dial so the possibly-updated agent re-handshakes.
    async fn send_install_finished(&self, error: Option<&str>) -> Result<()> {
        let body = json!({ "errorMessage": error.unwrap_or_default() });

        let result = self
            .publisher
            .publish_request(
                ws::METHOD_INSTALL_DEVICE_PACKAGES_FINISHED,
                ws::ORCHESTRATOR_ID,
                body,
                RequestOptions::with_timeout(FINISH_NOTICE_TIMEOUT),
            )
            .await;
        self.publisher.reconnect();

        match result {
            Ok(response) if response.is_error_response() => {
                Err(ControlError::Internal(response.error()))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateHandler for MaintenanceStateHandler {
    fn state_id(&self) -> AppState {
        AppState::Maintenance
    }

    fn validate_transition(&self, from: AppState) -> Result<()> {
        match from {
            AppState::Active | AppState::Boot => Ok(()),
            _ => Err(ControlError::TransitionNotSupported {
                from,
                to: self.state_id(),
            }),
        }
    }

    async fn handle(
        &self,
        tx: &Arc<Transaction>,
        transition: &Transition,
    ) -> Result<Option<Transition>> {
        match transition {
            Transition::OnAfterBoot(_) => {
                tracing::info!(state = %self.state_id(), "after boot transition");

                let mut update_err = self
                    .wait_install_finished_after_boot()
                    .await
                    .err()
                    .map(|e| e.to_string());
                if let Err(e) = self.send_install_finished(update_err.as_deref()).await {
                    tracing::error!(error = %e, "send install finished failed");
                    update_err = Some(match update_err {
                        Some(previous) => format!("{previous}; {e}"),
                        None => e.to_string(),
                    });
                }

                Ok(Some(Transition::OnUpdateDeviceFinished(update_err)))
            }

            Transition::OnUpdateDevice(value) => {
                tracing::info!(state = %self.state_id(), "update device transition");

                let request: InstallPackageRequest = serde_json::from_value(value.clone())
                    .map_err(|e| ControlError::BadRequest(e.to_string()))?;

                let mut update_err = self
                    .update_device(tx, request)
                    .await
                    .err()
                    .map(|e| e.to_string());
                if let Err(e) = self.send_install_finished(update_err.as_deref()).await {
                    tracing::error!(error = %e, "send install finished failed");
                    update_err = Some(match update_err {
                        Some(previous) => format!("{previous}; {e}"),
                        None => e.to_string(),
                    });
                }

                Ok(Some(Transition::OnUpdateDeviceFinished(update_err)))
            }

            other => Err(ControlError::InvalidTransitionType {
                state: self.state_id(),
                transition: other.kind(),
            }),
        }
    }

    async fn on_exit(&self, _tx: &Arc<Transaction>, _transition: &Transition) -> Result<()> {
        Ok(())
    }
}
