//! The `active` state: normal operation under an orchestrator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use edgelink_activity::{ActivityService, Transaction};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_conn::Publisher;
use edgelink_core::consts::{mq, services};
use edgelink_core::{AppState, DeviceRole, Transition};
use edgelink_mq::MqService;
use edgelink_store::{AppSection, DeviceConfig};

use crate::error::{ControlError, Result};
use crate::handlers::{subscribe_subjects, unsubscribe_subjects, StateHandler};
use crate::services::device_init::DeviceInitService;
use crate::services::first_port::FirstPortService;
use crate::services::systemd::SystemdService;

const DEVICE_INIT_TIMEOUT: Duration = Duration::from_secs(120);
const STARTER_SHUTDOWN_DELAY: Duration = Duration::from_millis(200);

const SUBJECTS: [&str; 2] = [mq::AGENT_RESET, mq::AGENT_REBUILD_SERVICES];

/// Handler of the `active` state.
pub struct ActiveStateHandler {
    config: Arc<ConfigService>,
    systemd: Arc<SystemdService>,
    mq: Arc<MqService>,
    publisher: Arc<Publisher>,
    first_port: Arc<FirstPortService>,
    device_init: Arc<DeviceInitService>,
    activity: Arc<ActivityService>,
    role: DeviceRole,
    device_init_timeout: Duration,
}

impl ActiveStateHandler {
    /// Create the handler.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        systemd: Arc<SystemdService>,
        mq: Arc<MqService>,
        publisher: Arc<Publisher>,
        first_port: Arc<FirstPortService>,
        device_init: Arc<DeviceInitService>,
        activity: Arc<ActivityService>,
        role: DeviceRole,
    ) -> Self {
        Self {
            config,
            systemd,
            mq,
            publisher,
            first_port,
            device_init,
            activity,
            role,
            device_init_timeout: DEVICE_INIT_TIMEOUT,
        }
    }

    /// Override the first-init deadline.
    #[must_use]
    pub const fn with_device_init_timeout(mut self, timeout: Duration) -> Self {
        self.device_init_timeout = timeout;
        self
    }

    async fn run_first_setup(
        &self,
        tx: &Arc<Transaction>,
        serial_number: &str,
        orchestrator_addrs: &[String],
    ) -> Result<()> {
        let config = self.config.get_config()?;

        let has_wan_port = config
            .port
            .as_ref()
            .is_some_and(|port| !port.port_configs.is_empty());
        if !has_wan_port {
            return Err(ControlError::BadRequest(
                "wan port not configured".to_string(),
            ));
        }

        for addr in orchestrator_addrs {
            if !addr.starts_with("http://") && !addr.starts_with("https://") {
                return Err(ControlError::BadRequest(format!(
                    "orchestrator address {addr} has no scheme"
                )));
            }
        }

        self.config
            .update_config_with_tx(
                tx,
                &DeviceConfig {
                    app: Some(AppSection {
                        serial_number: serial_number.to_string(),
                        orchestrator_addrs: orchestrator_addrs.to_vec(),
                        ..AppSection::default()
                    }),
                    ..DeviceConfig::default()
                },
                UpdateOptions::default(),
            )
            .await?;

        self.systemd
            .enable_with_tx(tx, services::UPDATE_MANAGER)
            .await?;
        self.systemd
            .try_start_with_tx(tx, services::UPDATE_MANAGER)
            .await?;

        let wait_init = self.device_init.wait_first_init(Arc::clone(tx))?;

        self.start_publisher(tx)?;

        // the orchestrator drives init over the fresh websocket; wait here
        // so a silent orchestrator rolls the whole setup back
        match tokio::time::timeout(self.device_init_timeout, wait_init).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => return Err(ControlError::Internal(message)),
            Ok(Err(_)) => return Err(ControlError::ControllerClosed),
            Err(_) => {
                self.device_init.complete_first_init(Err("timeout".into()));
                return Err(ControlError::DeviceInitTimeout);
            }
        }

        if self.role != DeviceRole::Hub {
            self.systemd.try_stop_with_tx(tx, services::ISC_DHCP).await?;
        }

        subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;

        if self.role != DeviceRole::Hub {
            let systemd = Arc::clone(&self.systemd);
            let first_port = Arc::clone(&self.first_port);
            tokio::spawn(async move {
                tokio::time::sleep(STARTER_SHUTDOWN_DELAY).await;
                deactivate_starter(&systemd, &first_port).await;
            });
        }

        Ok(())
    }

    async fn migrate_from_old_version(
        &self,
        tx: &Arc<Transaction>,
        serial_number: &str,
        orchestrator_addr: &str,
    ) -> Result<()> {
        let config = self.config.get_config()?;
        let mut app = config.app.unwrap_or_default();
        app.serial_number = serial_number.to_string();
        app.orchestrator_addrs = vec![orchestrator_addr.to_string()];

        self.config
            .update_config_with_tx(
                tx,
                &DeviceConfig {
                    app: Some(app),
                    ..DeviceConfig::default()
                },
                UpdateOptions::default(),
            )
            .await?;

        self.activate_services(tx).await?;
        self.start_publisher(tx)?;
        subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;

        Ok(())
    }

    /// Synchronize daemons and subscriptions with the `active` posture.
    async fn restore_active_state(&self, tx: &Arc<Transaction>) -> Result<()> {
        self.activate_services(tx).await?;

        self.systemd
            .try_stop_with_tx(tx, services::AGENT_STARTER)
            .await?;

        if !self.publisher.is_started() {
            self.start_publisher(tx)?;
        }

        subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)
    }

    async fn activate_services(&self, tx: &Transaction) -> Result<()> {
        self.systemd
            .try_start_with_tx(tx, services::UPDATE_MANAGER)
            .await
    }

    fn start_publisher(&self, tx: &Transaction) -> Result<()> {
        let start = Arc::clone(&self.publisher);
        let stop = Arc::clone(&self.publisher);
        self.activity.execute_fn(
            tx,
            "start publisher",
            move || start.start().map_err(|e| e.to_string()),
            move || stop.stop().map_err(|e| e.to_string()),
        )?;
        Ok(())
    }
}

/// Stop the starter service and clear the provisioning address. Failures are
/// logged; the device is already adopted at this point.
async fn deactivate_starter(systemd: &SystemdService, first_port: &FirstPortService) {
    if let Err(e) = systemd.try_stop(services::AGENT_STARTER).await {
        tracing::error!(error = %e, "stop starter failed");
    }
    if let Err(e) = first_port.clear_static().await {
        tracing::error!(error = %e, "clear first port failed");
    }
}

#[async_trait]
impl StateHandler for ActiveStateHandler {
    fn state_id(&self) -> AppState {
        AppState::Active
    }

    fn validate_transition(&self, _from: AppState) -> Result<()> {
        Ok(())
    }

    async fn handle(
        &self,
        tx: &Arc<Transaction>,
        transition: &Transition,
    ) -> Result<Option<Transition>> {
        match transition {
            Transition::OnAfterBoot(_) | Transition::OnFallback => {
                tracing::info!(
                    state = %self.state_id(),
                    transition = transition.kind(),
                    "restoring active state"
                );
                self.restore_active_state(tx).await?;
                Ok(None)
            }

            Transition::OnFirstSetup {
                serial_number,
                orchestrator_addrs,
            } => {
                tracing::info!(state = %self.state_id(), "first setup transition");
                self.run_first_setup(tx, serial_number, orchestrator_addrs)
                    .await?;
                Ok(None)
            }

            Transition::OnMigrateFromOldVersion {
                serial_number,
                orchestrator_addr,
            } => {
                tracing::info!(state = %self.state_id(), "migrate from old version transition");
                self.migrate_from_old_version(tx, serial_number, orchestrator_addr)
                    .await?;
                Ok(None)
            }

            Transition::OnUpdateConfigFinished => {
                tracing::info!(state = %self.state_id(), "update config finished transition");
                subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;
                Ok(None)
            }

            Transition::OnUpdateDeviceFinished(error) => {
                tracing::info!(state = %self.state_id(), "update device finished transition");
                if let Some(message) = error {
                    tracing::error!(error = %message, "device update finished with error");
                }
                subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;
                self.activate_services(tx).await?;
                Ok(None)
            }

            other => Err(ControlError::InvalidTransitionType {
                state: self.state_id(),
                transition: other.kind(),
            }),
        }
    }

    async fn on_exit(&self, tx: &Arc<Transaction>, _transition: &Transition) -> Result<()> {
        unsubscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)
    }
}
