//! Websocket method handlers.
//!
//! Server-initiated methods arrive through the publisher's route table; each
//! handler returns the response body or an `(status, error)` pair. Handlers
//! that change state go through the controller so the change is
//! transactional; completion notices go back out as agent-initiated
//! requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use edgelink_conn::{Publisher, RequestOptions, WsEnvelope, WsRouteHandler};
use edgelink_core::consts::ws;
use edgelink_core::Transition;

use crate::controller::StateService;
use crate::error::ControlError;
use crate::services::device_init::{DeviceInitService, InitConfig};
use crate::services::update_manager::UpdateManagerService;

const FINISH_NOTICE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

fn status_of(error: &ControlError) -> (u16, String) {
    if error.is_bad_request() {
        (400, error.to_string())
    } else {
        (500, error.to_string())
    }
}

/// `update_all_configs`: apply the pushed partial config, then report the
/// outcome with `update_all_configs_finished`.
pub struct UpdateAllConfigsRoute {
    controller: Arc<StateService>,
    publisher: Arc<Publisher>,
}

#[async_trait]
impl WsRouteHandler for UpdateAllConfigsRoute {
    async fn handle(&self, request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        let result = self
            .controller
            .perform(Transition::OnUpdateConfig(request.body))
            .await;

        let error_message = result.as_ref().err().map(ToString::to_string);
        let notice = json!({ "errorMessage": error_message.clone().unwrap_or_default() });
        if let Err(e) = self
            .publisher
            .publish_request(
                ws::METHOD_UPDATE_ALL_CONFIGS_FINISHED,
                ws::ORCHESTRATOR_ID,
                notice,
                RequestOptions::with_timeout(FINISH_NOTICE_TIMEOUT),
            )
            .await
        {
            tracing::error!(error = %e, "send update finished failed");
        }

        match result {
            Ok(()) => Ok(Value::Null),
            Err(e) => Err(status_of(&e)),
        }
    }
}

/// `init_device`: apply the orchestrator's init payload, then report the
/// outcome with `init_device_finished`.
pub struct InitDeviceRoute {
    device_init: Arc<DeviceInitService>,
}

#[async_trait]
impl WsRouteHandler for InitDeviceRoute {
    async fn handle(&self, request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        let init: InitConfig = serde_json::from_value(request.body)
            .map_err(|e| (400, format!("bad init payload: {e}")))?;

        let result = self.device_init.init_device(init).await;
        let error_message = result.as_ref().err().map(ToString::to_string);

        let device_init = Arc::clone(&self.device_init);
        tokio::spawn(async move {
            if let Err(e) = device_init.send_init_finished(error_message).await {
                tracing::error!(error = %e, "send init finished failed");
            }
        });

        match result {
            Ok(()) => Ok(Value::Null),
            Err(e) => Err(status_of(&e)),
        }
    }
}

/// `get_agent_state`: report the live app state.
pub struct GetAgentStateRoute {
    controller: Arc<StateService>,
}

#[async_trait]
impl WsRouteHandler for GetAgentStateRoute {
    async fn handle(&self, _request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        Ok(json!({ "state": self.controller.active_state().to_string() }))
    }
}

/// `install_device_packages`: run the install through `maintenance`.
pub struct InstallDevicePackagesRoute {
    controller: Arc<StateService>,
}

#[async_trait]
impl WsRouteHandler for InstallDevicePackagesRoute {
    async fn handle(&self, request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        match self
            .controller
            .perform(Transition::OnUpdateDevice(request.body))
            .await
        {
            Ok(()) => Ok(Value::Null),
            Err(e) => Err(status_of(&e)),
        }
    }
}

/// `download_device_packages`: forward to the update manager.
pub struct DownloadDevicePackagesRoute {
    update_manager: Arc<UpdateManagerService>,
}

#[async_trait]
impl WsRouteHandler for DownloadDevicePackagesRoute {
    async fn handle(&self, request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        match self.update_manager.download(&request.body).await {
            Ok(()) => Ok(Value::Null),
            Err(e) => Err(status_of(&e)),
        }
    }
}

/// `get_packages_versions`: read installed versions from the update manager.
pub struct GetPackagesVersionsRoute {
    update_manager: Arc<UpdateManagerService>,
}

#[async_trait]
impl WsRouteHandler for GetPackagesVersionsRoute {
    async fn handle(&self, _request: WsEnvelope) -> std::result::Result<Value, (u16, String)> {
        match self.update_manager.get_versions().await {
            Ok(response) => Ok(serde_json::to_value(response.extra).unwrap_or_default()),
            Err(e) => Err(status_of(&e)),
        }
    }
}

/// Build the method → handler table installed on the publisher at boot.
#[must_use]
pub fn ws_routes(
    controller: &Arc<StateService>,
    publisher: &Arc<Publisher>,
    device_init: &Arc<DeviceInitService>,
    update_manager: &Arc<UpdateManagerService>,
) -> HashMap<String, Arc<dyn WsRouteHandler>> {
    let mut routes: HashMap<String, Arc<dyn WsRouteHandler>> = HashMap::new();

    routes.insert(
        ws::METHOD_UPDATE_ALL_CONFIGS.to_string(),
        Arc::new(UpdateAllConfigsRoute {
            controller: Arc::clone(controller),
            publisher: Arc::clone(publisher),
        }),
    );
    routes.insert(
        ws::METHOD_INIT_DEVICE.to_string(),
        Arc::new(InitDeviceRoute {
            device_init: Arc::clone(device_init),
        }),
    );
    routes.insert(
        ws::METHOD_GET_AGENT_STATE.to_string(),
        Arc::new(GetAgentStateRoute {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        ws::METHOD_INSTALL_DEVICE_PACKAGES.to_string(),
        Arc::new(InstallDevicePackagesRoute {
            controller: Arc::clone(controller),
        }),
    );
    routes.insert(
        ws::METHOD_DOWNLOAD_DEVICE_PACKAGES.to_string(),
        Arc::new(DownloadDevicePackagesRoute {
            update_manager: Arc::clone(update_manager),
        }),
    );
    routes.insert(
        ws::METHOD_GET_PACKAGES_VERSIONS.to_string(),
        Arc::new(GetPackagesVersionsRoute {
            update_manager: Arc::clone(update_manager),
        }),
    );

    routes
}
