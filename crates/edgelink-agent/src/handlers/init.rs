//! The `init` state: ZTP, awaiting provisioning.

use std::sync::Arc;

use async_trait::async_trait;

use edgelink_activity::{ActivityService, Transaction};
use edgelink_core::consts::{mq, services};
use edgelink_core::{AgentEnv, AppState, DeviceRole, Transition};
use edgelink_mq::MqService;

use crate::error::{ControlError, Result};
use crate::handlers::{subscribe_subjects, unsubscribe_subjects, StateHandler};
use crate::services::systemd::SystemdService;

const SUBJECTS: [&str; 7] = [
    mq::AGENT_ZTP_FIRST_SETUP,
    mq::AGENT_ZTP_SET_PORT,
    mq::AGENT_ZTP_DEL_PORT,
    mq::AGENT_HUB_SET_PORT,
    mq::AGENT_HUB_DEL_PORT,
    mq::AGENT_HUB_INIT,
    mq::AGENT_RESET,
];

/// Handler of the `init` state.
pub struct InitStateHandler {
    mq: Arc<MqService>,
    systemd: Arc<SystemdService>,
    activity: Arc<ActivityService>,
    env: AgentEnv,
}

impl InitStateHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        mq: Arc<MqService>,
        systemd: Arc<SystemdService>,
        activity: Arc<ActivityService>,
        env: AgentEnv,
    ) -> Self {
        Self {
            mq,
            systemd,
            activity,
            env,
        }
    }

    /// Restore the ZTP posture: provisioning subjects live, adopted-device
    /// daemons down, ZTP daemons up.
    async fn restore_init_state(&self, tx: &Transaction) -> Result<()> {
        subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;

        // adopted-device daemons are stopped best-effort; their absence is
        // the invariant, not the stop itself
        self.systemd
            .disable_and_stop_logged(services::BGP_ADAPTER)
            .await;
        self.systemd
            .disable_and_stop_logged(services::UPDATE_MANAGER)
            .await;

        if self.env.role != DeviceRole::Hub {
            self.systemd
                .try_start_with_tx(tx, services::AGENT_STARTER)
                .await?;
            self.systemd
                .try_start_with_tx(tx, services::ISC_DHCP)
                .await?;
        }

        Ok(())
    }

    /// A real serial in the bootstrap env means a previous agent generation
    /// already adopted this device.
    fn needs_migration(&self) -> bool {
        let device_id = &self.env.device_id;
        if device_id.is_empty() {
            return false;
        }
        // placeholder ids are stamped with x characters
        !device_id.contains(['x', 'X'])
    }
}

#[async_trait]
impl StateHandler for InitStateHandler {
    fn state_id(&self) -> AppState {
        AppState::Init
    }

    fn validate_transition(&self, from: AppState) -> Result<()> {
        match from {
            AppState::Boot | AppState::ZtpSetup | AppState::Reset => Ok(()),
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

                if self.needs_migration() {
                    return Ok(Some(Transition::OnMigrateFromOldVersion {
                        serial_number: self.env.device_id.clone(),
                        orchestrator_addr: self.env.endpoint.clone(),
                    }));
                }

                self.restore_init_state(tx).await?;
                Ok(None)
            }

            Transition::OnInitFallback => {
                tracing::info!(state = %self.state_id(), "init fallback transition");
                self.restore_init_state(tx).await?;
                Ok(None)
            }

            Transition::OnZtpSetupInterrupted => {
                tracing::info!(state = %self.state_id(), "ztp interrupted transition");
                self.restore_init_state(tx).await?;
                Ok(None)
            }

            Transition::OnZtpSetupFinished | Transition::OnHubResetFinished => {
                tracing::info!(
                    state = %self.state_id(),
                    transition = transition.kind(),
                    "re-entering init"
                );
                subscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)?;
                Ok(None)
            }

            other => Err(ControlError::InvalidTransitionType {
                state: self.state_id(),
                transition: other.kind(),
            }),
        }
    }

    async fn on_exit(&self, tx: &Arc<Transaction>, transition: &Transition) -> Result<()> {
        // migration runs before the subjects were ever activated
        if matches!(transition, Transition::OnMigrateFromOldVersion { .. }) {
            return Ok(());
        }

        unsubscribe_subjects(&self.activity, tx, &self.mq, &SUBJECTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use edgelink_activity::handlers::ExecCommandHandler;
    use edgelink_activity::{ServiceOptions, Shell, TransactionOptions};
    use edgelink_mq::{LocalBus, MqHandler, MqResponse};
    use edgelink_store::{RocksStore, Store};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct RecordingShell {
        ran: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Shell for RecordingShell {
        async fn exec(&self, command: &str) -> edgelink_activity::Result<()> {
            self.ran.lock().push(command.to_string());
            Ok(())
        }
        async fn exec_output(&self, command: &str) -> edgelink_activity::Result<Vec<u8>> {
            self.ran.lock().push(command.to_string());
            Ok(Vec::new())
        }
    }

    struct NullHandler;

    #[async_trait]
    impl MqHandler for NullHandler {
        async fn handle(&self, _payload: &[u8]) -> MqResponse {
            MqResponse::ok()
        }
    }

    struct Fixture {
        handler: InitStateHandler,
        mq: Arc<MqService>,
        activity: Arc<ActivityService>,
        ran: Arc<Mutex<Vec<String>>>,
        _dir: TempDir,
    }

    fn fixture(role: DeviceRole, device_id: &str, endpoint: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let ran = Arc::new(Mutex::new(Vec::new()));
        let shell: Arc<dyn Shell> = Arc::new(RecordingShell {
            ran: Arc::clone(&ran),
        });
        let activity = Arc::new(
            ActivityService::new(
                store,
                vec![Arc::new(ExecCommandHandler::new(Arc::clone(&shell)))],
                ServiceOptions::default(),
            )
            .unwrap(),
        );

        let mq = Arc::new(MqService::new(LocalBus::new()));
        let handlers: HashMap<String, Arc<dyn MqHandler>> = SUBJECTS
            .iter()
            .map(|subject| {
                (
                    (*subject).to_string(),
                    Arc::new(NullHandler) as Arc<dyn MqHandler>,
                )
            })
            .collect();
        mq.register_handlers(handlers);

        let env = AgentEnv {
            role,
            endpoint: endpoint.to_string(),
            device_id: device_id.to_string(),
            wg_config_root: String::new(),
            log_file: String::new(),
            log_level: "info".to_string(),
        };
        let systemd = Arc::new(SystemdService::new(shell, Arc::clone(&activity)));

        Fixture {
            handler: InitStateHandler::new(Arc::clone(&mq), systemd, Arc::clone(&activity), env),
            mq,
            activity,
            ran,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn validate_rejects_active() {
        let fixture = fixture(DeviceRole::Cpe, "", "");
        assert!(fixture.handler.validate_transition(AppState::Boot).is_ok());
        assert!(fixture.handler.validate_transition(AppState::Reset).is_ok());
        assert!(matches!(
            fixture.handler.validate_transition(AppState::Active),
            Err(ControlError::TransitionNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn after_boot_restores_ztp_posture_on_cpe() {
        let fixture = fixture(DeviceRole::Cpe, "", "");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::Init))
            .await
            .unwrap();
        assert!(follow_up.is_none());

        for subject in SUBJECTS {
            assert!(fixture.mq.is_active(subject), "{subject} not active");
        }

        let ran = fixture.ran.lock().clone();
        assert!(ran.contains(&"systemctl stop sdwan-bgp-adapter".to_string()));
        assert!(ran.contains(&"systemctl start sdwan-agent-starter".to_string()));
        assert!(ran.contains(&"systemctl start isc-dhcp-server".to_string()));
    }

    #[tokio::test]
    async fn hub_skips_cpe_daemons() {
        let fixture = fixture(DeviceRole::Hub, "", "");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        fixture
            .handler
            .handle(&tx, &Transition::OnInitFallback)
            .await
            .unwrap();

        let ran = fixture.ran.lock().clone();
        assert!(!ran.iter().any(|cmd| cmd.contains("isc-dhcp-server")
            || cmd.contains("sdwan-agent-starter")));
    }

    #[tokio::test]
    async fn after_boot_emits_migration_for_real_serial() {
        let fixture = fixture(DeviceRole::Cpe, "SN-450", "https://orch.local");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::Init))
            .await
            .unwrap();

        match follow_up {
            Some(Transition::OnMigrateFromOldVersion {
                serial_number,
                orchestrator_addr,
            }) => {
                assert_eq!(serial_number, "SN-450");
                assert_eq!(orchestrator_addr, "https://orch.local");
            }
            other => panic!("expected migration follow-up, got {other:?}"),
        }
        // no subjects were activated on the migration path
        assert!(!fixture.mq.is_active(mq::AGENT_RESET));
    }

    #[tokio::test]
    async fn placeholder_serial_does_not_migrate() {
        let fixture = fixture(DeviceRole::Cpe, "xxxx-0000", "https://orch.local");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::Init))
            .await
            .unwrap();
        assert!(follow_up.is_none());
    }

    #[tokio::test]
    async fn rollback_deactivates_subscribed_subjects() {
        let fixture = fixture(DeviceRole::Hub, "", "");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        fixture
            .handler
            .handle(&tx, &Transition::OnZtpSetupFinished)
            .await
            .unwrap();
        assert!(fixture.mq.is_active(mq::AGENT_ZTP_FIRST_SETUP));

        fixture
            .activity
            .finish_transaction(&tx, Some("boom"))
            .await
            .unwrap();
        assert!(!fixture.mq.is_active(mq::AGENT_ZTP_FIRST_SETUP));
    }

    #[tokio::test]
    async fn exit_skips_unsubscribe_on_migration() {
        let fixture = fixture(DeviceRole::Cpe, "", "");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        fixture
            .handler
            .on_exit(
                &tx,
                &Transition::OnMigrateFromOldVersion {
                    serial_number: "SN1".into(),
                    orchestrator_addr: "https://orch.local".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(tx.step_count(), 0);
    }

    #[tokio::test]
    async fn invalid_transition_type_is_rejected() {
        let fixture = fixture(DeviceRole::Cpe, "", "");
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let err = fixture.handler.handle(&tx, &Transition::OnReset).await;
        assert!(matches!(
            err,
            Err(ControlError::InvalidTransitionType { .. })
        ));
    }
}
