//! The `reset` state: factory reset in progress.
//!
//! A CPE reset tears the device back to the ZTP posture and reboots; the
//! embedded store directory is dropped by the reboot path, so everything
//! after the final checkpoint must already be on disk. A hub reset keeps the
//! port section and ends in `init` without rebooting.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use edgelink_activity::{ActivityService, Shell, Transaction};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_conn::Publisher;
use edgelink_core::consts::services;
use edgelink_core::{AppState, DeviceRole, Transition};
use edgelink_store::DeviceConfig;

use crate::error::{ControlError, Result};
use crate::handlers::StateHandler;
use crate::services::first_port::FirstPortService;
use crate::services::hostname::HostnameService;
use crate::services::systemd::SystemdService;

const DEFAULT_HOSTNAME: &str = "cpe-default";
const REBOOT_CMD: &str = "systemctl reboot";

/// Handler of the `reset` state.
pub struct ResetStateHandler {
    shell: Arc<dyn Shell>,
    config: Arc<ConfigService>,
    publisher: Arc<Publisher>,
    systemd: Arc<SystemdService>,
    first_port: Arc<FirstPortService>,
    hostname: Arc<HostnameService>,
    activity: Arc<ActivityService>,
    role: DeviceRole,
    env_path: PathBuf,
}

impl ResetStateHandler {
    /// Create the handler.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        shell: Arc<dyn Shell>,
        config: Arc<ConfigService>,
        publisher: Arc<Publisher>,
        systemd: Arc<SystemdService>,
        first_port: Arc<FirstPortService>,
        hostname: Arc<HostnameService>,
        activity: Arc<ActivityService>,
        role: DeviceRole,
        env_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            config,
            publisher,
            systemd,
            first_port,
            hostname,
            activity,
            role,
            env_path: env_path.into(),
        }
    }

    fn stop_publisher(&self, tx: &Transaction) -> Result<()> {
        if !self.publisher.is_started() {
            return Ok(());
        }

        let stop = Arc::clone(&self.publisher);
        let start = Arc::clone(&self.publisher);
        self.activity.execute_fn(
            tx,
            "stop publisher",
            move || stop.stop().map_err(|e| e.to_string()),
            move || start.start().map_err(|e| e.to_string()),
        )?;
        Ok(())
    }

    /// Reset a CPE to the ZTP stage.
    async fn reset(&self, tx: &Arc<Transaction>) -> Result<()> {
        self.stop_publisher(tx)?;

        self.hostname
            .update_hostname_with_tx(tx, DEFAULT_HOSTNAME)
            .await?;

        self.config
            .update_config_with_tx(tx, &DeviceConfig::empty(), UpdateOptions::default())
            .await?;

        // 192.168.1.1 for the installer
        self.first_port.setup_static_with_tx(tx).await?;

        self.systemd.enable_with_tx(tx, services::AGENT_STARTER).await?;
        self.systemd.enable_with_tx(tx, services::ISC_DHCP).await?;

        self.systemd
            .try_stop_with_tx(tx, services::BGP_ADAPTER)
            .await?;
        self.systemd
            .try_stop_with_tx(tx, services::UPDATE_MANAGER)
            .await?;

        // past this point the reset is committed: the reboot wipes the
        // process, and recovery must not undo the ZTP posture
        let checkpoint = self.activity.add_checkpoint(tx)?;

        if let Err(e) = self.try_reset_env() {
            tracing::error!(error = %e, "reset env failed");
        }

        if let Err(e) = self.shell.exec(REBOOT_CMD).await {
            // the committed action never became observable
            if let Err(delete_err) = self.activity.delete_checkpoint(tx, &checkpoint) {
                tracing::error!(error = %delete_err, "delete checkpoint failed");
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Reset a hub: keep the port section, end in `init`, no reboot.
    async fn reset_hub(&self, tx: &Arc<Transaction>) -> Result<()> {
        let old = self.config.get_config()?;

        self.stop_publisher(tx)?;

        self.hostname
            .update_hostname_with_tx(tx, DEFAULT_HOSTNAME)
            .await?;

        let mut reset_config = DeviceConfig::empty();
        reset_config.port = old.port;
        self.config
            .update_config_with_tx(tx, &reset_config, UpdateOptions::default())
            .await?;

        self.systemd
            .try_stop_with_tx(tx, services::BGP_ADAPTER)
            .await?;
        self.systemd
            .try_stop_with_tx(tx, services::UPDATE_MANAGER)
            .await?;

        if let Err(e) = self.try_reset_env() {
            tracing::error!(error = %e, "reset env failed");
        }

        Ok(())
    }

    /// Blank the bootstrap identity, preserving the remaining lines.
    fn try_reset_env(&self) -> Result<()> {
        let data = std::fs::read_to_string(&self.env_path)
            .map_err(|e| ControlError::Internal(format!("read env file: {e}")))?;

        let mut out = String::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let key = line.split('=').next().unwrap_or_default().trim();
            match key {
                "AGENT_ENDPOINT" => out.push_str("AGENT_ENDPOINT=\"\"\n"),
                "AGENT_ID" => out.push_str("AGENT_ID=\"\"\n"),
                _ => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }

        std::fs::write(&self.env_path, out)
            .map_err(|e| ControlError::Internal(format!("write env file: {e}")))?;
        Ok(())
    }

    fn was_init_state(&self) -> Result<bool> {
        let config = self.config.get_config()?;
        Ok(config
            .app
            .map_or(true, |app| app.serial_number.is_empty()))
    }
}

#[async_trait]
impl StateHandler for ResetStateHandler {
    fn state_id(&self) -> AppState {
        AppState::Reset
    }

    fn validate_transition(&self, from: AppState) -> Result<()> {
        match from {
            AppState::Boot | AppState::Init | AppState::Active => Ok(()),
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
                tracing::error!("reset operation was interrupted");

                if self.was_init_state()? {
                    Ok(Some(Transition::OnInitFallback))
                } else {
                    Ok(Some(Transition::OnFallback))
                }
            }

            Transition::OnReset => {
                tracing::info!(state = %self.state_id(), "reset transition");

                if self.role == DeviceRole::Hub {
                    self.reset_hub(tx).await?;
                    Ok(Some(Transition::OnHubResetFinished))
                } else {
                    self.reset(tx).await?;
                    Ok(None)
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use edgelink_activity::handlers::{ExecCommandHandler, UpdateFileHandler};
    use edgelink_activity::{ServiceOptions, TransactionOptions};
    use edgelink_config::UpdateStoreSectionHandler;
    use edgelink_conn::{DiscoveryService, ProbeClient};
    use edgelink_store::{AppSection, RocksStore, Store};
    use serde_json::json;
    use tempfile::TempDir;

    struct NeverPrimary;

    #[async_trait]
    impl ProbeClient for NeverPrimary {
        async fn check_primary(&self, _host: &str) -> edgelink_conn::Result<bool> {
            Ok(false)
        }
    }

    struct RecordingShell {
        ran: Arc<Mutex<Vec<String>>>,
        fail_reboot: bool,
    }

    #[async_trait]
    impl Shell for RecordingShell {
        async fn exec(&self, command: &str) -> edgelink_activity::Result<()> {
            if self.fail_reboot && command == REBOOT_CMD {
                return Err(edgelink_activity::ActivityError::Command {
                    command: command.to_string(),
                    message: "exit 1".to_string(),
                });
            }
            self.ran.lock().push(command.to_string());
            Ok(())
        }
        async fn exec_output(&self, command: &str) -> edgelink_activity::Result<Vec<u8>> {
            self.ran.lock().push(command.to_string());
            Ok(b"SN1\n".to_vec())
        }
    }

    struct Fixture {
        handler: ResetStateHandler,
        config: Arc<ConfigService>,
        activity: Arc<ActivityService>,
        ran: Arc<Mutex<Vec<String>>>,
        env_path: PathBuf,
        _dir: TempDir,
    }

    async fn fixture(role: DeviceRole, fail_reboot: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path().join("store")).unwrap());
        let ran = Arc::new(Mutex::new(Vec::new()));
        let shell: Arc<dyn Shell> = Arc::new(RecordingShell {
            ran: Arc::clone(&ran),
            fail_reboot,
        });
        let activity = Arc::new(
            ActivityService::new(
                Arc::clone(&store),
                vec![
                    Arc::new(UpdateStoreSectionHandler::new(Arc::clone(&store))),
                    Arc::new(ExecCommandHandler::new(Arc::clone(&shell))),
                    Arc::new(UpdateFileHandler::new()),
                ],
                ServiceOptions::default(),
            )
            .unwrap(),
        );
        let config = Arc::new(ConfigService::new(store, Arc::clone(&activity), vec![]));

        config
            .update_config(&DeviceConfig {
                app: Some(AppSection {
                    serial_number: "SN1".into(),
                    orchestrator_addrs: vec!["https://orch.local".into()],
                    ..AppSection::default()
                }),
                ..DeviceConfig::default()
            })
            .await
            .unwrap();

        std::fs::write(dir.path().join("port1"), "iface port1 inet manual\n").unwrap();
        let env_path = dir.path().join("agent.env");
        std::fs::write(
            &env_path,
            "AGENT_ENDPOINT=\"https://orch.local\"\nAGENT_ID=\"SN1\"\nSDWAN_DEVICE=\"cpe\"\n",
        )
        .unwrap();

        let discovery = Arc::new(DiscoveryService::new(Arc::new(NeverPrimary)));
        let publisher = Publisher::new(Arc::clone(&config), discovery);
        let systemd = Arc::new(SystemdService::new(Arc::clone(&shell), Arc::clone(&activity)));
        let first_port = Arc::new(FirstPortService::new(
            Arc::clone(&shell),
            Arc::clone(&activity),
            dir.path(),
        ));
        let hostname = Arc::new(HostnameService::new(
            Arc::clone(&shell),
            Arc::clone(&activity),
            "edgelink-cli",
        ));

        let handler = ResetStateHandler::new(
            shell,
            Arc::clone(&config),
            publisher,
            systemd,
            first_port,
            hostname,
            Arc::clone(&activity),
            role,
            &env_path,
        );

        Fixture {
            handler,
            config,
            activity,
            ran,
            env_path,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn validate_rejects_maintenance() {
        let fixture = fixture(DeviceRole::Cpe, false).await;
        assert!(fixture.handler.validate_transition(AppState::Active).is_ok());
        assert!(matches!(
            fixture.handler.validate_transition(AppState::Maintenance),
            Err(ControlError::TransitionNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn cpe_reset_wipes_config_and_reboots() {
        let fixture = fixture(DeviceRole::Cpe, false).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnReset)
            .await
            .unwrap();
        assert!(follow_up.is_none());
        fixture.activity.finish_transaction(&tx, None).await.unwrap();

        let app = fixture.config.get_config().unwrap().app.unwrap();
        assert_eq!(app.serial_number, "");
        assert!(app.orchestrator_addrs.is_empty());

        let env = std::fs::read_to_string(&fixture.env_path).unwrap();
        assert!(env.contains("AGENT_ENDPOINT=\"\""));
        assert!(env.contains("AGENT_ID=\"\""));
        assert!(env.contains("SDWAN_DEVICE=\"cpe\""));

        let ran = fixture.ran.lock().clone();
        assert!(ran.contains(&"edgelink-cli hostname set cpe-default".to_string()));
        assert!(ran.contains(&"systemctl enable sdwan-agent-starter".to_string()));
        assert!(ran.contains(&"systemctl enable isc-dhcp-server".to_string()));
        assert!(ran.contains(&"systemctl stop sdwan-update-manager".to_string()));
        assert!(ran.contains(&REBOOT_CMD.to_string()));
    }

    #[tokio::test]
    async fn failed_reboot_reenables_rollback() {
        let fixture = fixture(DeviceRole::Cpe, true).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let err = fixture.handler.handle(&tx, &Transition::OnReset).await;
        assert!(err.is_err());

        fixture
            .activity
            .finish_transaction(&tx, Some("reboot failed"))
            .await
            .unwrap();

        // with the checkpoint deleted, the wipe rolled back
        let app = fixture.config.get_config().unwrap().app.unwrap();
        assert_eq!(app.serial_number, "SN1");
    }

    #[tokio::test]
    async fn hub_reset_keeps_ports_and_ends_in_init() {
        let fixture = fixture(DeviceRole::Hub, false).await;
        fixture
            .config
            .update_config(&DeviceConfig {
                port: Some(edgelink_store::PortSection {
                    port_configs: vec![edgelink_store::PortConfig {
                        name: "port1".into(),
                        port_type: "wan".into(),
                        wan: None,
                    }],
                }),
                ..DeviceConfig::default()
            })
            .await
            .unwrap();

        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();
        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnReset)
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnHubResetFinished)));
        fixture.activity.finish_transaction(&tx, None).await.unwrap();

        let stored = fixture.config.get_config().unwrap();
        assert_eq!(stored.app.unwrap().serial_number, "");
        assert_eq!(stored.port.unwrap().port_configs.len(), 1);

        let ran = fixture.ran.lock().clone();
        assert!(!ran.contains(&REBOOT_CMD.to_string()));
    }

    #[tokio::test]
    async fn after_boot_picks_the_fallback_by_serial() {
        let fixture = fixture(DeviceRole::Cpe, false).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        // serial present: fall back to active
        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::Reset))
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnFallback)));

        // serial blank: fall back to init
        fixture
            .config
            .update_config(&DeviceConfig {
                app: Some(AppSection::default()),
                ..DeviceConfig::default()
            })
            .await
            .unwrap();
        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::Reset))
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnInitFallback)));
    }

    #[tokio::test]
    async fn env_reset_preserves_unrelated_lines() {
        let fixture = fixture(DeviceRole::Cpe, false).await;
        std::fs::write(
            &fixture.env_path,
            "# managed by the installer\nAGENT_ENDPOINT=\"x\"\nAGENT_LOG_LEVEL=\"debug\"\n",
        )
        .unwrap();

        fixture.handler.try_reset_env().unwrap();

        let env = std::fs::read_to_string(&fixture.env_path).unwrap();
        assert_eq!(
            env,
            "# managed by the installer\nAGENT_ENDPOINT=\"\"\nAGENT_LOG_LEVEL=\"debug\"\n"
        );
    }

    #[tokio::test]
    async fn rejects_update_config_transition() {
        let fixture = fixture(DeviceRole::Cpe, false).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let err = fixture
            .handler
            .handle(&tx, &Transition::OnUpdateConfig(json!({})))
            .await;
        assert!(matches!(
            err,
            Err(ControlError::InvalidTransitionType { .. })
        ));
    }
}
