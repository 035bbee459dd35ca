//! Message-bus subject handlers.
//!
//! Each handler decodes its payload, synthesizes a transition (or reads
//! state), and maps the controller's outcome to a response status:
//! validation failures are `bad_request`, everything else `internal_error`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use edgelink_config::ConfigService;
use edgelink_core::consts::mq;
use edgelink_core::{DeviceRole, Transition};
use edgelink_mq::{MqHandler, MqResponse};
use edgelink_store::{DeviceConfig, PortSection};

use crate::controller::StateService;
use crate::error::ControlError;

fn error_response(error: &ControlError) -> MqResponse {
    if error.is_bad_request() {
        MqResponse::bad_request(error.to_string())
    } else {
        MqResponse::internal_error(error.to_string())
    }
}

/// `agent.ztp.first_setup`
pub struct ZtpFirstSetupHandler {
    controller: Arc<StateService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirstSetupBody {
    #[serde(default)]
    serial_number: String,
    #[serde(default)]
    orchestrator_addrs: Vec<String>,
}

#[async_trait]
impl MqHandler for ZtpFirstSetupHandler {
    async fn handle(&self, payload: &[u8]) -> MqResponse {
        let body: FirstSetupBody = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => return MqResponse::bad_request(e.to_string()),
        };
        if body.serial_number.is_empty() {
            return MqResponse::bad_request("serialNumber is required");
        }
        if body.orchestrator_addrs.is_empty() {
            return MqResponse::bad_request("orchestratorAddrs is required");
        }

        match self
            .controller
            .perform(Transition::OnFirstSetup {
                serial_number: body.serial_number,
                orchestrator_addrs: body.orchestrator_addrs,
            })
            .await
        {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.ztp.set_port`
pub struct ZtpSetPortHandler {
    controller: Arc<StateService>,
}

#[async_trait]
impl MqHandler for ZtpSetPortHandler {
    async fn handle(&self, payload: &[u8]) -> MqResponse {
        let port: Value = match serde_json::from_slice(payload) {
            Ok(port) => port,
            Err(e) => return MqResponse::bad_request(e.to_string()),
        };
        if port.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
            return MqResponse::bad_request("port name is required");
        }

        let partial = json!({ "port": { "portConfigs": [port] } });
        match self
            .controller
            .perform(Transition::OnZtpSetupConfig(partial))
            .await
        {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.ztp.del_port`
pub struct ZtpDelPortHandler {
    controller: Arc<StateService>,
}

#[async_trait]
impl MqHandler for ZtpDelPortHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        let partial =
            serde_json::to_value(DeviceConfig {
                port: Some(PortSection::default()),
                ..DeviceConfig::default()
            })
            .unwrap_or_default();

        match self
            .controller
            .perform(Transition::OnZtpSetupConfig(partial))
            .await
        {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.get_config`
pub struct GetConfigHandler {
    config: Arc<ConfigService>,
}

#[async_trait]
impl MqHandler for GetConfigHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        match self.config.get_config() {
            Ok(config) => MqResponse::ok()
                .with_field("config", serde_json::to_value(config).unwrap_or_default()),
            Err(e) => MqResponse::internal_error(e.to_string()),
        }
    }
}

/// `agent.rebuild_services`
pub struct RebuildServicesHandler {
    controller: Arc<StateService>,
}

#[async_trait]
impl MqHandler for RebuildServicesHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        match self.controller.perform(Transition::OnRebuildServices).await {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.reset`
pub struct ResetHandler {
    controller: Arc<StateService>,
}

#[async_trait]
impl MqHandler for ResetHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        match self.controller.perform(Transition::OnReset).await {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.hub.set_port`
pub struct HubSetPortHandler {
    controller: Arc<StateService>,
    role: DeviceRole,
}

#[async_trait]
impl MqHandler for HubSetPortHandler {
    async fn handle(&self, payload: &[u8]) -> MqResponse {
        if self.role != DeviceRole::Hub {
            return MqResponse::bad_request("device is not a hub");
        }

        let port: Value = match serde_json::from_slice(payload) {
            Ok(port) => port,
            Err(e) => return MqResponse::bad_request(e.to_string()),
        };

        match self.controller.perform(Transition::OnHubSetPort(port)).await {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.hub.del_port`
pub struct HubDelPortHandler {
    controller: Arc<StateService>,
    role: DeviceRole,
}

#[async_trait]
impl MqHandler for HubDelPortHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        if self.role != DeviceRole::Hub {
            return MqResponse::bad_request("device is not a hub");
        }

        match self.controller.perform(Transition::OnHubDeletePort).await {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.hub.list_ports`
pub struct HubListPortsHandler {
    config: Arc<ConfigService>,
}

#[async_trait]
impl MqHandler for HubListPortsHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        match self.config.get_config() {
            Ok(config) => {
                let ports = config.port.unwrap_or_default().port_configs;
                MqResponse::ok()
                    .with_field("ports", serde_json::to_value(ports).unwrap_or_default())
            }
            Err(e) => MqResponse::internal_error(e.to_string()),
        }
    }
}

/// `agent.hub.init`
pub struct HubInitHandler {
    controller: Arc<StateService>,
    role: DeviceRole,
}

#[async_trait]
impl MqHandler for HubInitHandler {
    async fn handle(&self, payload: &[u8]) -> MqResponse {
        if self.role != DeviceRole::Hub {
            return MqResponse::bad_request("device is not a hub");
        }

        let body: FirstSetupBody = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => return MqResponse::bad_request(e.to_string()),
        };
        if body.serial_number.is_empty() {
            return MqResponse::bad_request("serialNumber is required");
        }
        if body.orchestrator_addrs.is_empty() {
            return MqResponse::bad_request("orchestratorAddrs is required");
        }

        match self
            .controller
            .perform(Transition::OnFirstSetup {
                serial_number: body.serial_number,
                orchestrator_addrs: body.orchestrator_addrs,
            })
            .await
        {
            Ok(()) => MqResponse::ok(),
            Err(e) => error_response(&e),
        }
    }
}

/// `agent.debug.dump_heap`
pub struct DumpHeapHandler;

#[async_trait]
impl MqHandler for DumpHeapHandler {
    async fn handle(&self, _payload: &[u8]) -> MqResponse {
        match std::fs::read_to_string("/proc/self/statm") {
            Ok(statm) => {
                tracing::info!(statm = %statm.trim(), "memory dump requested");
                MqResponse::ok().with_field("statm", Value::String(statm.trim().to_string()))
            }
            Err(e) => MqResponse::internal_error(e.to_string()),
        }
    }
}

/// Build the full subject → handler map registered at boot.
#[must_use]
pub fn mq_routes(
    controller: &Arc<StateService>,
    config: &Arc<ConfigService>,
    role: DeviceRole,
) -> HashMap<String, Arc<dyn MqHandler>> {
    let mut routes: HashMap<String, Arc<dyn MqHandler>> = HashMap::new();

    routes.insert(
        mq::AGENT_ZTP_FIRST_SETUP.to_string(),
        Arc::new(ZtpFirstSetupHandler {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        mq::AGENT_ZTP_SET_PORT.to_string(),
        Arc::new(ZtpSetPortHandler {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        mq::AGENT_ZTP_DEL_PORT.to_string(),
        Arc::new(ZtpDelPortHandler {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        mq::AGENT_GET_CONFIG.to_string(),
        Arc::new(GetConfigHandler {
            config: Arc::clone(config),
        }),
    );
    routes.insert(
        mq::AGENT_REBUILD_SERVICES.to_string(),
        Arc::new(RebuildServicesHandler {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        mq::AGENT_RESET.to_string(),
        Arc::new(ResetHandler {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        mq::AGENT_HUB_SET_PORT.to_string(),
        Arc::new(HubSetPortHandler {
            controller: Arc::clone(controller),
            role,
        }),
    );
    routes.insert(
        mq::AGENT_HUB_DEL_PORT.to_string(),
        Arc::new(HubDelPortHandler {
            controller: Arc::clone(controller),
            role,
        }),
    );
    routes.insert(
        mq::AGENT_HUB_LIST_PORTS.to_string(),
        Arc::new(HubListPortsHandler {
            config: Arc::clone(config),
        }),
    );
    routes.insert(
        mq::AGENT_HUB_INIT.to_string(),
        Arc::new(HubInitHandler {
            controller: Arc::clone(controller),
            role,
        }),
    );
    routes.insert(mq::AGENT_DEBUG_DUMP_HEAP.to_string(), Arc::new(DumpHeapHandler));

    routes
}
