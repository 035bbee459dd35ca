//! Device initialization pushed by the orchestrator.
//!
//! After first setup starts the publisher, the orchestrator answers with an
//! `init_device` request carrying the full device payload. When a first
//! setup is waiting, the payload is applied inside the waiting transaction
//! and the rendezvous resolved; otherwise (re-init of an adopted device) the
//! service runs its own transaction.
//!
//! Only one first-init may be pending at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use edgelink_activity::{ActivityService, Transaction, TransactionOptions};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_conn::{Publisher, RequestOptions};
use edgelink_core::consts::ws;
use edgelink_core::DeviceRole;
use edgelink_store::{DeviceConfig, ObjectsSection, PonySection, PortSection};

use crate::error::{ControlError, Result};
use crate::services::hostname::HostnameService;
use crate::services::tunnel::{check_hub_tunnels, Pinger, TunnelMonitor};
use crate::services::update_manager::UpdateManagerService;

const WS_PROBE_ATTEMPTS: u32 = 10;
const WS_PROBE_INTERVAL: Duration = Duration::from_secs(2);
const TUNNEL_DEADLINE: Duration = Duration::from_secs(40);
const FINISH_RETRIES: u32 = 5;
const FINISH_BACKOFF: Duration = Duration::from_secs(2);
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Service sections of the init payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesInit {
    /// Trunk objects.
    #[serde(default)]
    pub trunk: Option<ObjectsSection>,
    /// L3 objects.
    #[serde(default)]
    pub l3: Option<ObjectsSection>,
    /// ISB objects.
    #[serde(default)]
    pub isb: Option<ObjectsSection>,
    /// Bridge objects.
    #[serde(default)]
    pub bridge: Option<ObjectsSection>,
    /// Point-to-point objects.
    #[serde(default)]
    pub p2p: Option<ObjectsSection>,
    /// Firewall objects.
    #[serde(default)]
    pub fw: Option<ObjectsSection>,
}

/// The `init_device` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    /// Orchestrator base URLs; empty keeps the configured ones.
    #[serde(default)]
    pub orchestrator_addrs: Vec<String>,
    /// OpenFlow controller address, `host:port`.
    #[serde(default)]
    pub of_controller_addr: String,
    /// Package source for the update manager.
    #[serde(default)]
    pub apt_source: String,
    /// Wireguard tunnels.
    #[serde(default)]
    pub wireguard: Option<ObjectsSection>,
    /// Port configuration.
    #[serde(default)]
    pub port: Option<PortSection>,
    /// WAN protection rules.
    #[serde(default)]
    pub wan_protection: Option<ObjectsSection>,
    /// Loopback addresses.
    #[serde(default)]
    pub loopback: Option<ObjectsSection>,
    /// Policy-routing rules.
    #[serde(default)]
    pub ip_rule: Option<ObjectsSection>,
    /// Administrative port states.
    #[serde(default)]
    pub admin_state: Option<ObjectsSection>,
    /// Tunnel-cluster monitoring.
    #[serde(default)]
    pub pony: Option<PonySection>,
    /// Service objects, installed last.
    #[serde(default)]
    pub services: ServicesInit,
}

struct FirstInit {
    tx: Arc<Transaction>,
    reply: oneshot::Sender<std::result::Result<(), String>>,
}

/// Applies orchestrator-pushed device initialization.
pub struct DeviceInitService {
    publisher: Arc<Publisher>,
    hostname: Arc<HostnameService>,
    config: Arc<ConfigService>,
    tunnel: Arc<TunnelMonitor>,
    pinger: Arc<dyn Pinger>,
    update_manager: Arc<UpdateManagerService>,
    activity: Arc<ActivityService>,
    role: DeviceRole,

    first_init: Mutex<Option<FirstInit>>,
    initializing: AtomicBool,

    ws_probe_attempts: u32,
    ws_probe_interval: Duration,
    tunnel_deadline: Duration,
}

impl DeviceInitService {
    /// Create the service.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        publisher: Arc<Publisher>,
        hostname: Arc<HostnameService>,
        config: Arc<ConfigService>,
        tunnel: Arc<TunnelMonitor>,
        pinger: Arc<dyn Pinger>,
        update_manager: Arc<UpdateManagerService>,
        activity: Arc<ActivityService>,
        role: DeviceRole,
    ) -> Self {
        Self {
            publisher,
            hostname,
            config,
            tunnel,
            pinger,
            update_manager,
            activity,
            role,
            first_init: Mutex::new(None),
            initializing: AtomicBool::new(false),
            ws_probe_attempts: WS_PROBE_ATTEMPTS,
            ws_probe_interval: WS_PROBE_INTERVAL,
            tunnel_deadline: TUNNEL_DEADLINE,
        }
    }

    /// Override the liveness probes. Zero attempts disables the websocket
    /// probe.
    #[must_use]
    pub const fn with_probes(
        mut self,
        ws_attempts: u32,
        ws_interval: Duration,
        tunnel_deadline: Duration,
    ) -> Self {
        self.ws_probe_attempts = ws_attempts;
        self.ws_probe_interval = ws_interval;
        self.tunnel_deadline = tunnel_deadline;
        self
    }

    /// True while an init payload is being applied.
    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    /// Register the one-shot first-init rendezvous.
    ///
    /// The next `init_device` request is applied inside `tx` and the
    /// returned channel resolved with its outcome.
    ///
    /// # Errors
    ///
    /// Returns an error when a first-init is already pending.
    pub fn wait_first_init(
        &self,
        tx: Arc<Transaction>,
    ) -> Result<oneshot::Receiver<std::result::Result<(), String>>> {
        let mut slot = self.first_init.lock();
        if slot.is_some() {
            return Err(ControlError::Internal(
                "already waiting for first init".to_string(),
            ));
        }

        let (reply, receiver) = oneshot::channel();
        *slot = Some(FirstInit { tx, reply });
        Ok(receiver)
    }

    /// Resolve the pending rendezvous, if any.
    pub fn complete_first_init(&self, result: std::result::Result<(), String>) -> bool {
        match self.first_init.lock().take() {
            Some(pending) => {
                let _ = pending.reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Apply an orchestrator init payload.
    ///
    /// # Errors
    ///
    /// Returns an error when a payload is already being applied or any step
    /// fails; a pending first-init rendezvous is resolved either way.
    pub async fn init_device(&self, init: InitConfig) -> Result<()> {
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(ControlError::Internal(
                "device already initializing".to_string(),
            ));
        }

        self.tunnel.pause();
        let result = self.init_device_inner(init).await;
        self.tunnel.resume();
        self.initializing.store(false, Ordering::SeqCst);
        result
    }

    async fn init_device_inner(&self, init: InitConfig) -> Result<()> {
        let pending_tx = self
            .first_init
            .lock()
            .as_ref()
            .map(|pending| Arc::clone(&pending.tx));

        match pending_tx {
            Some(tx) => {
                let result = self.apply(&tx, init).await;
                self.complete_first_init(
                    result.as_ref().map(|()| ()).map_err(ToString::to_string),
                );
                result
            }
            None => {
                let tx = self.activity.start_transaction(
                    "init device transaction",
                    TransactionOptions::skip_on_fail(),
                )?;
                let result = self.apply(&tx, init).await;
                let exec_err = result.as_ref().err().map(ToString::to_string);
                self.activity
                    .finish_transaction(&tx, exec_err.as_deref())
                    .await?;
                result
            }
        }
    }

    async fn apply(&self, tx: &Arc<Transaction>, init: InitConfig) -> Result<()> {
        let old = self.config.get_config()?;
        let mut app = old
            .app
            .ok_or_else(|| ControlError::Internal("app configuration missing".to_string()))?;
        let serial = app.serial_number.clone();

        let tunnel_addr = init
            .of_controller_addr
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        app.orchestrator_tunnel_addr = tunnel_addr;
        if !init.orchestrator_addrs.is_empty() {
            app.orchestrator_addrs = init.orchestrator_addrs.clone();
        }

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

        self.hostname.update_hostname_with_tx(tx, &serial).await?;
        self.update_manager.set_apt_source(&init.apt_source).await?;

        // rules before services: the service objects depend on them
        let rules = DeviceConfig {
            wireguard: init.wireguard.clone(),
            port: init.port.clone(),
            wan_protection: init.wan_protection.clone(),
            loopback: init.loopback.clone(),
            ip_rule: init.ip_rule.clone(),
            admin_state: init.admin_state.clone(),
            pony: init.pony.clone(),
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &rules, UpdateOptions::default())
            .await?;

        if self.role == DeviceRole::Cpe {
            if let Some(pony) = &init.pony {
                check_hub_tunnels(&self.pinger, pony, self.tunnel_deadline).await?;
            }
        }

        self.check_websocket_connection().await?;

        let services = DeviceConfig {
            trunk: init.services.trunk,
            l3: init.services.l3,
            isb: init.services.isb,
            bridge: init.services.bridge,
            p2p: init.services.p2p,
            fw: init.services.fw,
            ..DeviceConfig::default()
        };
        self.config
            .update_config_with_tx(tx, &services, UpdateOptions::default())
            .await?;

        Ok(())
    }

    async fn check_websocket_connection(&self) -> Result<()> {
        if self.ws_probe_attempts == 0 {
            return Ok(());
        }

        for _ in 0..self.ws_probe_attempts {
            tokio::time::sleep(self.ws_probe_interval).await;
            if self.publisher.is_active() {
                return Ok(());
            }
        }

        Err(ControlError::Conn(edgelink_conn::ConnError::NotActive))
    }

    /// Publish the init-finished notice, retrying with backoff and forcing
    /// a reconnect on persistent failure.
    ///
    /// # Errors
    ///
    /// Returns the last publish error after every retry failed.
    pub async fn send_init_finished(&self, error: Option<String>) -> Result<()> {
        let body = json!({ "errorMessage": error.unwrap_or_default() });

        let mut last_err = ControlError::Conn(edgelink_conn::ConnError::NotActive);
        for attempt in 0..FINISH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(FINISH_BACKOFF).await;
            }

            match self
                .publisher
                .publish_request(
                    ws::METHOD_INIT_DEVICE_FINISHED,
                    ws::ORCHESTRATOR_ID,
                    body.clone(),
                    RequestOptions::with_timeout(FINISH_TIMEOUT),
                )
                .await
            {
                Ok(response) if !response.is_error_response() => return Ok(()),
                Ok(response) => {
                    last_err = ControlError::Internal(response.error());
                }
                Err(e) => last_err = e.into(),
            }
        }

        self.publisher.reconnect();
        Err(last_err)
    }
}
