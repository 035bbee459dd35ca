//! Wiring and the startup/shutdown sequence.
//!
//! Construction order follows the dependency graph: store → activity engine
//! (with its handler registry) → config service (with the generator chain) →
//! connection stack → device services → controller. Startup then recovers
//! dangling journals exactly once, activates the permanently-available
//! subjects, boots the controller through after-boot recovery and spawns the
//! long-running tasks.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use edgelink_activity::handlers::{
    ExecCommandHandler, ExecCommandsHandler, UpdateFileHandler, WriteFileHandler,
};
use edgelink_activity::{ActivityService, ServiceOptions, Shell};
use edgelink_config::{
    CliServiceHandler, ConfigService, RuleGenerator, ServiceHandler, ServiceMergeGenerator,
    UpdateStoreSectionHandler,
};
use edgelink_conn::{
    DiscoveryMonitor, DiscoveryService, HttpProbeClient, Publisher, ReconnectSignal,
};
use edgelink_core::consts::{mq, paths, CLI_EXECUTABLE};
use edgelink_core::{AgentEnv, AppState};
use edgelink_mq::{MessageBus, MqService};
use edgelink_store::{RocksStore, SectionKind, Store};

use crate::controller::StateService;
use crate::error::Result;
use crate::handlers::{
    ActiveStateHandler, BootStateHandler, InitStateHandler, MaintenanceStateHandler,
    ResetStateHandler, StateHandler, UpdateConfigStateHandler, ZtpSetupHandler,
};
use crate::routes::{mq_routes, ws_routes};
use crate::services::{
    DeviceInitService, DnsResolver, FirstPortService, HostnameService, HostsSync, ShellPinger,
    SystemdService, TunnelMonitor, UpdateManagerService,
};

/// Filesystem locations the agent uses; overridable for tests.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    /// Embedded store directory.
    pub store: PathBuf,
    /// interfaces.d directory.
    pub interfaces_dir: PathBuf,
    /// Bootstrap env file.
    pub env_file: PathBuf,
    /// Hosts file.
    pub hosts_file: PathBuf,
}

impl AgentPaths {
    /// The production layout.
    #[must_use]
    pub fn system() -> Self {
        Self {
            store: paths::AGENT_CONFIG.into(),
            interfaces_dir: paths::NETWORK_INTERFACES_DIR.into(),
            env_file: paths::AGENT_ENV.into(),
            hosts_file: paths::ETC_HOSTS.into(),
        }
    }
}

/// The wired agent.
pub struct Agent {
    /// Parsed environment.
    pub env: AgentEnv,
    /// Activity engine.
    pub activity: Arc<ActivityService>,
    /// Config service.
    pub config: Arc<ConfigService>,
    /// Bus adapter.
    pub mq: Arc<MqService>,
    /// Websocket publisher.
    pub publisher: Arc<Publisher>,
    /// App-state controller.
    pub controller: Arc<StateService>,
    /// Hosts pinning.
    pub hosts: Arc<HostsSync>,
    monitor: Arc<DiscoveryMonitor>,
    state_handlers: Vec<Arc<dyn StateHandler>>,
}

impl Agent {
    /// Construct every service and wire the routes.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or the activity
    /// handler registry is inconsistent.
    pub fn build(
        env: AgentEnv,
        agent_paths: &AgentPaths,
        bus: Arc<dyn MessageBus>,
        shell: Arc<dyn Shell>,
    ) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(&agent_paths.store)?);

        let activity = Arc::new(ActivityService::new(
            Arc::clone(&store),
            vec![
                Arc::new(UpdateStoreSectionHandler::new(Arc::clone(&store))),
                Arc::new(ExecCommandHandler::new(Arc::clone(&shell))),
                Arc::new(ExecCommandsHandler::new(Arc::clone(&shell))),
                Arc::new(WriteFileHandler::new()),
                Arc::new(UpdateFileHandler::new()),
            ],
            ServiceOptions::default(),
        )?);

        // providers sort lower than their dependents
        let service_handlers: Vec<Arc<dyn ServiceHandler>> = [
            (SectionKind::Trunk, 10),
            (SectionKind::P2p, 20),
            (SectionKind::Bridge, 30),
            (SectionKind::L3, 40),
            (SectionKind::Dhcp, 50),
            (SectionKind::Isb, 60),
            (SectionKind::Fw, 70),
        ]
        .into_iter()
        .map(|(kind, priority)| {
            Arc::new(CliServiceHandler::new(
                kind,
                priority,
                CLI_EXECUTABLE,
                Arc::clone(&activity),
            )) as Arc<dyn ServiceHandler>
        })
        .collect();
        let generators: Vec<Arc<dyn RuleGenerator>> =
            vec![Arc::new(ServiceMergeGenerator::new(service_handlers))];

        let config = Arc::new(ConfigService::new(
            Arc::clone(&store),
            Arc::clone(&activity),
            generators,
        ));

        let discovery = Arc::new(DiscoveryService::new(Arc::new(HttpProbeClient::new())));
        let publisher = Publisher::new(Arc::clone(&config), Arc::clone(&discovery));
        let mq_service = Arc::new(MqService::new(bus));

        let systemd = Arc::new(SystemdService::new(Arc::clone(&shell), Arc::clone(&activity)));
        let hostname = Arc::new(HostnameService::new(
            Arc::clone(&shell),
            Arc::clone(&activity),
            CLI_EXECUTABLE,
        ));
        let first_port = Arc::new(FirstPortService::new(
            Arc::clone(&shell),
            Arc::clone(&activity),
            &agent_paths.interfaces_dir,
        ));
        let hosts = Arc::new(HostsSync::new(
            Arc::clone(&config),
            Arc::new(DnsResolver),
            &agent_paths.hosts_file,
        ));
        let tunnel = TunnelMonitor::new();
        let pinger: Arc<dyn crate::services::Pinger> =
            Arc::new(ShellPinger::new(Arc::clone(&shell)));
        let update_manager = Arc::new(UpdateManagerService::new(
            Arc::clone(&mq_service),
            Arc::clone(&shell),
            CLI_EXECUTABLE,
        ));
        let device_init = Arc::new(DeviceInitService::new(
            Arc::clone(&publisher),
            Arc::clone(&hostname),
            Arc::clone(&config),
            Arc::clone(&tunnel),
            Arc::clone(&pinger),
            Arc::clone(&update_manager),
            Arc::clone(&activity),
            env.role,
        ));

        let controller = StateService::new(Arc::clone(&config), Arc::clone(&activity), AppState::Init);

        let state_handlers: Vec<Arc<dyn StateHandler>> = vec![
            Arc::new(BootStateHandler::new()),
            Arc::new(InitStateHandler::new(
                Arc::clone(&mq_service),
                Arc::clone(&systemd),
                Arc::clone(&activity),
                env.clone(),
            )),
            Arc::new(ActiveStateHandler::new(
                Arc::clone(&config),
                Arc::clone(&systemd),
                Arc::clone(&mq_service),
                Arc::clone(&publisher),
                Arc::clone(&first_port),
                Arc::clone(&device_init),
                Arc::clone(&activity),
                env.role,
            )),
            Arc::new(UpdateConfigStateHandler::new(
                Arc::clone(&config),
                Arc::clone(&tunnel),
                Arc::clone(&pinger),
                Arc::clone(&hosts),
                Arc::clone(&publisher),
                env.role,
            )),
            Arc::new(MaintenanceStateHandler::new(
                Arc::clone(&mq_service),
                Arc::clone(&config),
                Arc::clone(&publisher),
                Arc::clone(&update_manager),
                Arc::clone(&activity),
                Arc::clone(&shell),
            )),
            Arc::new(ZtpSetupHandler::new(
                Arc::clone(&config),
                Arc::clone(&activity),
                CLI_EXECUTABLE,
            )),
            Arc::new(ResetStateHandler::new(
                Arc::clone(&shell),
                Arc::clone(&config),
                Arc::clone(&publisher),
                Arc::clone(&systemd),
                Arc::clone(&first_port),
                Arc::clone(&hostname),
                Arc::clone(&activity),
                env.role,
                &agent_paths.env_file,
            )),
        ];

        mq_service.register_handlers(mq_routes(&controller, &config, env.role));
        publisher.set_routes(ws_routes(
            &controller,
            &publisher,
            &device_init,
            &update_manager,
        ));

        let monitor = Arc::new(DiscoveryMonitor::new(
            Arc::clone(&publisher) as Arc<dyn ReconnectSignal>,
            Arc::clone(&config),
            discovery,
        ));

        Ok(Self {
            env,
            activity,
            config,
            mq: mq_service,
            publisher,
            controller,
            hosts,
            monitor,
            state_handlers,
        })
    }

    /// Run the startup sequence and spawn the long-running tasks.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal startup failures: an inconsistent handler
    /// registry or a failed after-boot recovery.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        // undo whatever a previous life left half-done, before any dispatch
        tracing::info!("rolling back dangling transactions");
        if let Err(e) = self.activity.recover_dangling().await {
            tracing::error!(error = %e, "dangling transaction recovery failed");
        }

        if let Err(e) = self.hosts.sync_hosts() {
            tracing::error!(error = %e, "hosts sync failed");
        }

        // permanently-available subjects
        self.mq.activate_handler(mq::AGENT_GET_CONFIG)?;
        self.mq.activate_handler(mq::AGENT_HUB_LIST_PORTS)?;
        self.mq.activate_handler(mq::AGENT_DEBUG_DUMP_HEAP)?;

        tracing::info!("starting app state controller");
        self.controller
            .set_state_handlers(self.state_handlers.clone())?;
        self.controller.boot().await?;

        {
            let controller = Arc::clone(&self.controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await });
        }
        {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move { monitor.run(cancel).await });
        }

        tracing::info!(state = %self.controller.active_state(), "agent started");
        Ok(())
    }

    /// Graceful shutdown: publisher, then the bus. The store closes when the
    /// last reference drops.
    pub fn shutdown(&self) {
        if let Err(e) = self.publisher.stop() {
            tracing::error!(error = %e, "publisher shutdown failed");
        }
        self.mq.close();
        tracing::info!("agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use edgelink_core::DeviceRole;
    use edgelink_mq::LocalBus;
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

    fn test_env(role: DeviceRole) -> AgentEnv {
        AgentEnv {
            role,
            endpoint: String::new(),
            device_id: String::new(),
            wg_config_root: String::new(),
            log_file: String::new(),
            log_level: "info".to_string(),
        }
    }

    fn test_paths(dir: &TempDir) -> AgentPaths {
        let env_file = dir.path().join("agent.env");
        std::fs::write(&env_file, "AGENT_ID=\"\"\n").unwrap();
        let hosts_file = dir.path().join("hosts");
        std::fs::write(&hosts_file, "127.0.0.1 localhost\n").unwrap();
        std::fs::write(dir.path().join("port1"), "iface port1 inet manual\n").unwrap();

        AgentPaths {
            store: dir.path().join("store"),
            interfaces_dir: dir.path().to_path_buf(),
            env_file,
            hosts_file,
        }
    }

    #[tokio::test]
    async fn fresh_cpe_boots_into_init() {
        let dir = TempDir::new().unwrap();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let agent = Agent::build(
            test_env(DeviceRole::Cpe),
            &test_paths(&dir),
            LocalBus::new(),
            Arc::new(RecordingShell {
                ran: Arc::clone(&ran),
            }),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        agent.start(cancel.clone()).await.unwrap();

        assert_eq!(agent.controller.active_state(), AppState::Init);
        assert!(agent.mq.is_active(mq::AGENT_GET_CONFIG));
        assert!(agent.mq.is_active(mq::AGENT_HUB_LIST_PORTS));
        assert!(agent.mq.is_active(mq::AGENT_ZTP_FIRST_SETUP));

        // the ZTP posture brought the provisioning daemons up
        let ran = ran.lock().clone();
        assert!(ran.contains(&"systemctl start sdwan-agent-starter".to_string()));

        cancel.cancel();
        agent.shutdown();
    }

    #[tokio::test]
    async fn recorded_state_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        let paths = test_paths(&dir);
        let shell = Arc::new(RecordingShell {
            ran: Arc::new(Mutex::new(Vec::new())),
        });

        {
            let agent = Agent::build(
                test_env(DeviceRole::Cpe),
                &paths,
                LocalBus::new(),
                Arc::clone(&shell) as Arc<dyn Shell>,
            )
            .unwrap();
            let cancel = CancellationToken::new();
            agent.start(cancel.clone()).await.unwrap();
            assert_eq!(agent.controller.active_state(), AppState::Init);
            cancel.cancel();
            agent.shutdown();
        }

        // second life reads the recorded state back
        let agent = Agent::build(
            test_env(DeviceRole::Cpe),
            &paths,
            LocalBus::new(),
            shell,
        )
        .unwrap();
        let cancel = CancellationToken::new();
        agent.start(cancel.clone()).await.unwrap();
        assert_eq!(agent.controller.active_state(), AppState::Init);
        cancel.cancel();
        agent.shutdown();
    }

    #[tokio::test]
    async fn interrupted_transition_is_rolled_back_on_start() {
        let dir = TempDir::new().unwrap();
        let paths = test_paths(&dir);
        let shell = Arc::new(RecordingShell {
            ran: Arc::new(Mutex::new(Vec::new())),
        });

        // first life: journal a step, then "crash" without finishing
        {
            let agent = Agent::build(
                test_env(DeviceRole::Cpe),
                &paths,
                LocalBus::new(),
                Arc::clone(&shell) as Arc<dyn Shell>,
            )
            .unwrap();

            let tx = agent
                .activity
                .start_transaction(
                    "interrupted",
                    edgelink_activity::TransactionOptions::skip_on_fail(),
                )
                .unwrap();
            agent
                .config
                .update_config_with_tx(
                    &tx,
                    &edgelink_store::DeviceConfig {
                        app: Some(edgelink_store::AppSection {
                            serial_number: "SN-GHOST".into(),
                            ..edgelink_store::AppSection::default()
                        }),
                        ..edgelink_store::DeviceConfig::default()
                    },
                    edgelink_config::UpdateOptions::default(),
                )
                .await
                .unwrap();
            assert_eq!(
                agent
                    .config
                    .get_config()
                    .unwrap()
                    .app
                    .unwrap()
                    .serial_number,
                "SN-GHOST"
            );
            // no finish: the journal survives the drop
        }

        // second life: recovery undoes the write before dispatch starts
        let agent = Agent::build(test_env(DeviceRole::Cpe), &paths, LocalBus::new(), shell).unwrap();
        let cancel = CancellationToken::new();
        agent.start(cancel.clone()).await.unwrap();

        assert!(agent.config.get_config().unwrap().app.is_none());
        cancel.cancel();
        agent.shutdown();
    }
}
