//! The `update_config` state: applying a partial configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use edgelink_activity::Transaction;
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_conn::Publisher;
use edgelink_core::{AppState, DeviceRole, Transition};
use edgelink_store::{DeviceConfig, ObjectsSection};

use crate::error::{ControlError, Result};
use crate::handlers::StateHandler;
use crate::services::hosts::HostsSync;
use crate::services::tunnel::{check_hub_tunnels, Pinger, TunnelMonitor};

const TUNNEL_DEADLINE: Duration = Duration::from_secs(40);

/// Handler of the `update_config` state.
pub struct UpdateConfigStateHandler {
    config: Arc<ConfigService>,
    tunnel: Arc<TunnelMonitor>,
    pinger: Arc<dyn Pinger>,
    hosts: Arc<HostsSync>,
    publisher: Arc<Publisher>,
    role: DeviceRole,
    tunnel_deadline: Duration,
}

impl UpdateConfigStateHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        tunnel: Arc<TunnelMonitor>,
        pinger: Arc<dyn Pinger>,
        hosts: Arc<HostsSync>,
        publisher: Arc<Publisher>,
        role: DeviceRole,
    ) -> Self {
        Self {
            config,
            tunnel,
            pinger,
            hosts,
            publisher,
            role,
            tunnel_deadline: TUNNEL_DEADLINE,
        }
    }

    /// Override the any-tunnel-up deadline.
    #[must_use]
    pub const fn with_tunnel_deadline(mut self, deadline: Duration) -> Self {
        self.tunnel_deadline = deadline;
        self
    }

    async fn update_config(&self, tx: &Arc<Transaction>, partial: &DeviceConfig) -> Result<()> {
        let old = self.config.get_config()?;

        let port_changed = is_port_configuration_changed(&old, partial);
        if port_changed {
            // reconfiguring ports rips the transport out from under the
            // websocket and the tunnel monitor; quiesce both first
            self.tunnel.pause();
            if let Err(e) = self.publisher.stop() {
                tracing::error!(error = %e, "stop publisher failed");
            }
        }

        if let Err(e) = self
            .config
            .update_config_with_tx(tx, partial, UpdateOptions::default())
            .await
        {
            if port_changed {
                self.tunnel.resume();
                if let Err(start_err) = self.publisher.start() {
                    tracing::error!(error = %start_err, "start publisher failed");
                }
            }
            return Err(e.into());
        }

        if let Some(new_app) = &partial.app {
            let app_changed = old.app.as_ref() != Some(new_app);
            if app_changed {
                if let Err(e) = self.hosts.sync_hosts() {
                    tracing::error!(error = %e, "sync hosts failed");
                }
            }
        }

        if !port_changed {
            return Ok(());
        }

        self.tunnel.resume();
        let result = if self.role == DeviceRole::Cpe {
            match &partial.pony {
                Some(pony) => check_hub_tunnels(&self.pinger, pony, self.tunnel_deadline).await,
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        if let Err(e) = self.publisher.start() {
            tracing::error!(error = %e, "start publisher failed");
        }
        result
    }

    /// Force every service object to be deleted and re-created: write empty
    /// service sections, then the saved originals, in the same transaction.
    async fn rebuild_services(&self, tx: &Arc<Transaction>) -> Result<()> {
        let config = self.config.get_config()?;

        let empty = DeviceConfig {
            trunk: Some(ObjectsSection::default()),
            p2p: Some(ObjectsSection::default()),
            bridge: Some(ObjectsSection::default()),
            l3: Some(ObjectsSection::default()),
            isb: Some(ObjectsSection::default()),
            fw: Some(ObjectsSection::default()),
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &empty, UpdateOptions::default())
            .await?;

        let original = DeviceConfig {
            trunk: config.trunk,
            p2p: config.p2p,
            bridge: config.bridge,
            l3: config.l3,
            isb: config.isb,
            fw: config.fw,
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &original, UpdateOptions::default())
            .await?;

        Ok(())
    }
}

fn is_port_configuration_changed(old: &DeviceConfig, partial: &DeviceConfig) -> bool {
    if let Some(new_port) = &partial.port {
        if old.port.as_ref() != Some(new_port) {
            return true;
        }
    }

    if let Some(new_admin) = &partial.admin_state {
        if old.admin_state.as_ref() != Some(new_admin) {
            return true;
        }
    }

    false
}

#[async_trait]
impl StateHandler for UpdateConfigStateHandler {
    fn state_id(&self) -> AppState {
        AppState::UpdateConfig
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
                tracing::error!("config update was interrupted");
                Ok(Some(Transition::OnFallback))
            }

            Transition::OnUpdateConfig(value) => {
                tracing::info!(state = %self.state_id(), "update config transition");
                let partial: DeviceConfig = serde_json::from_value(value.clone())
                    .map_err(|e| ControlError::BadRequest(e.to_string()))?;
                self.update_config(tx, &partial).await?;
                Ok(Some(Transition::OnUpdateConfigFinished))
            }

            Transition::OnRebuildServices => {
                tracing::info!(state = %self.state_id(), "rebuild services transition");
                self.rebuild_services(tx).await?;
                Ok(Some(Transition::OnUpdateConfigFinished))
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
    use serde_json::json;

    use crate::services::hosts::Resolver;
    use crate::services::tunnel::PingOptions;
    use edgelink_activity::{ActivityService, ServiceOptions, TransactionOptions};
    use edgelink_config::{RuleGenerator, UpdateStoreSectionHandler};
    use edgelink_conn::{DiscoveryService, ProbeClient};
    use edgelink_store::{RocksStore, Store, WanMode};
    use tempfile::TempDir;

    struct NeverPrimary;

    #[async_trait]
    impl ProbeClient for NeverPrimary {
        async fn check_primary(&self, _host: &str) -> edgelink_conn::Result<bool> {
            Ok(false)
        }
    }

    struct AlivePinger;

    #[async_trait]
    impl Pinger for AlivePinger {
        async fn ping(&self, _addr: &str, _options: PingOptions) -> Result<bool> {
            Ok(true)
        }
    }

    struct NoResolver;

    impl Resolver for NoResolver {
        fn lookup(&self, _host: &str) -> std::io::Result<Vec<std::net::IpAddr>> {
            Ok(vec![])
        }
    }

    /// Records section-change announcements in generator order.
    struct SpyGenerator {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RuleGenerator for SpyGenerator {
        fn name(&self) -> &'static str {
            "spy"
        }

        async fn apply(
            &self,
            old: &DeviceConfig,
            new: &DeviceConfig,
            _tx: &Transaction,
        ) -> edgelink_config::Result<()> {
            let trunk_old = old.trunk.as_ref().map_or(0, |s| s.objects.len());
            let trunk_new = new.trunk.as_ref().map_or(0, |s| s.objects.len());
            if trunk_old != trunk_new {
                self.log.lock().push(format!("trunk:{trunk_old}->{trunk_new}"));
            }
            Ok(())
        }
    }

    struct Fixture {
        handler: UpdateConfigStateHandler,
        config: Arc<ConfigService>,
        activity: Arc<ActivityService>,
        generator_log: Arc<Mutex<Vec<String>>>,
        _dir: TempDir,
    }

    async fn fixture(role: DeviceRole) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path().join("store")).unwrap());
        let activity = Arc::new(
            ActivityService::new(
                Arc::clone(&store),
                vec![Arc::new(UpdateStoreSectionHandler::new(Arc::clone(&store)))],
                ServiceOptions::default(),
            )
            .unwrap(),
        );
        let generator_log = Arc::new(Mutex::new(Vec::new()));
        let config = Arc::new(ConfigService::new(
            store,
            Arc::clone(&activity),
            vec![Arc::new(SpyGenerator {
                log: Arc::clone(&generator_log),
            })],
        ));

        let discovery = Arc::new(DiscoveryService::new(Arc::new(NeverPrimary)));
        let publisher = Publisher::new(Arc::clone(&config), discovery);

        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1 localhost\n").unwrap();
        let hosts = Arc::new(HostsSync::new(
            Arc::clone(&config),
            Arc::new(NoResolver),
            hosts_path,
        ));

        let handler = UpdateConfigStateHandler::new(
            Arc::clone(&config),
            TunnelMonitor::new(),
            Arc::new(AlivePinger),
            hosts,
            publisher,
            role,
        )
        .with_tunnel_deadline(Duration::from_millis(200));

        Fixture {
            handler,
            config,
            activity,
            generator_log,
            _dir: dir,
        }
    }

    fn static_port_update() -> serde_json::Value {
        json!({
            "port": {
                "portConfigs": [{
                    "name": "port2",
                    "portType": "wan",
                    "wan": {
                        "mode": "static",
                        "ipAddr": "192.168.10.23",
                        "subnetMask": "255.255.255.0",
                        "gateway": "192.168.10.1",
                        "dns": "8.8.8.8"
                    }
                }]
            },
            "pony": {
                "clusters": [{
                    "network": "10.1.0.0/24",
                    "uplinks": [
                        {"name": "wg0", "monitorAddr": "10.1.0.1"},
                        {"name": "wg1", "monitorAddr": "10.1.0.2"}
                    ]
                }]
            }
        })
    }

    #[tokio::test]
    async fn validate_rejects_init() {
        let fixture = fixture(DeviceRole::Cpe).await;
        assert!(fixture.handler.validate_transition(AppState::Active).is_ok());
        assert!(matches!(
            fixture.handler.validate_transition(AppState::Init),
            Err(ControlError::TransitionNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn after_boot_falls_back_to_active() {
        let fixture = fixture(DeviceRole::Cpe).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnAfterBoot(AppState::UpdateConfig))
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnFallback)));
    }

    #[tokio::test]
    async fn port_change_checks_tunnels_and_emits_finished() {
        let fixture = fixture(DeviceRole::Cpe).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let follow_up = fixture
            .handler
            .handle(&tx, &Transition::OnUpdateConfig(static_port_update()))
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnUpdateConfigFinished)));
        fixture.activity.finish_transaction(&tx, None).await.unwrap();

        let stored = fixture.config.get_config().unwrap();
        let port = stored.port.unwrap().port_configs.remove(0);
        assert_eq!(port.wan.unwrap().mode, WanMode::Static);
        assert!(!fixture.handler.tunnel.is_paused());
        assert!(fixture.handler.publisher.is_started());

        fixture.handler.publisher.stop().unwrap();
    }

    #[tokio::test]
    async fn dead_tunnels_fail_the_update() {
        struct DeadPinger;
        #[async_trait]
        impl Pinger for DeadPinger {
            async fn ping(&self, _addr: &str, _options: PingOptions) -> Result<bool> {
                Ok(false)
            }
        }

        let mut fixture = fixture(DeviceRole::Cpe).await;
        fixture.handler.pinger = Arc::new(DeadPinger);

        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let err = fixture
            .handler
            .handle(&tx, &Transition::OnUpdateConfig(static_port_update()))
            .await;
        assert!(matches!(err, Err(ControlError::TunnelsDown)));

        fixture
            .activity
            .finish_transaction(&tx, Some("all tunnels down"))
            .await
            .unwrap();
        assert!(fixture.config.get_config().unwrap().port.is_none());

        fixture.handler.publisher.stop().ok();
    }

    #[tokio::test]
    async fn undecodable_partial_is_bad_request() {
        let fixture = fixture(DeviceRole::Cpe).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        let err = fixture
            .handler
            .handle(
                &tx,
                &Transition::OnUpdateConfig(json!({"port": {"portConfigs": 7}})),
            )
            .await;
        assert!(matches!(err, Err(ControlError::BadRequest(_))));
    }

    #[tokio::test]
    async fn rebuild_services_deletes_then_recreates() {
        let fixture = fixture(DeviceRole::Cpe).await;

        fixture
            .config
            .update_config(&DeviceConfig {
                trunk: Some(ObjectsSection {
                    objects: vec![json!({"id": "t1"}), json!({"id": "t2"})],
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
            .handle(&tx, &Transition::OnRebuildServices)
            .await
            .unwrap();
        assert!(matches!(follow_up, Some(Transition::OnUpdateConfigFinished)));
        fixture.activity.finish_transaction(&tx, None).await.unwrap();

        // the two-write shape: objects drop to zero, then come back
        assert_eq!(
            fixture.generator_log.lock().clone(),
            vec!["trunk:2->0", "trunk:0->2"]
        );
        assert_eq!(
            fixture.config.get_config().unwrap().trunk.unwrap().objects.len(),
            2
        );
    }

    #[tokio::test]
    async fn non_port_update_leaves_publisher_alone() {
        let fixture = fixture(DeviceRole::Cpe).await;
        let tx = fixture
            .activity
            .start_transaction("t", TransactionOptions::skip_on_fail())
            .unwrap();

        fixture
            .handler
            .handle(
                &tx,
                &Transition::OnUpdateConfig(json!({"fw": {"objects": [{"id": "r1"}]}})),
            )
            .await
            .unwrap();

        assert!(!fixture.handler.publisher.is_started());
        assert!(!fixture.handler.tunnel.is_paused());
    }
}
