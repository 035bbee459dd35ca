//! The `ztp_setup` state: applying provisioning commands.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use edgelink_activity::handlers::cmd::command_pair;
use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Transaction};
use edgelink_config::{ConfigService, UpdateOptions};
use edgelink_core::{AppState, Transition};
use edgelink_store::{DeviceConfig, PortConfig, PortSection};

use crate::error::{ControlError, Result};
use crate::handlers::StateHandler;

const STATIC_ROUTE_TABLE: u32 = 100;

/// Handler of the `ztp_setup` state.
pub struct ZtpSetupHandler {
    config: Arc<ConfigService>,
    activity: Arc<ActivityService>,
    cli: String,
}

impl ZtpSetupHandler {
    /// Create the handler over the port CLI executable.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        activity: Arc<ActivityService>,
        cli: impl Into<String>,
    ) -> Self {
        Self {
            config,
            activity,
            cli: cli.into(),
        }
    }

    async fn setup_ztp_config(&self, tx: &Arc<Transaction>, value: &Value) -> Result<()> {
        let partial: DeviceConfig = serde_json::from_value(value.clone())
            .map_err(|e| ControlError::BadRequest(e.to_string()))?;

        self.config
            .update_config_with_tx(tx, &partial, UpdateOptions::default())
            .await?;
        Ok(())
    }

    /// Configure the hub WAN port: persist the section and program the
    /// static address through the port CLI.
    async fn set_hub_port(&self, tx: &Arc<Transaction>, value: &Value) -> Result<()> {
        let port_config: PortConfig = serde_json::from_value(value.clone())
            .map_err(|e| ControlError::BadRequest(e.to_string()))?;

        self.config
            .update_config_with_tx(
                tx,
                &DeviceConfig {
                    port: Some(PortSection {
                        port_configs: vec![port_config.clone()],
                    }),
                    ..DeviceConfig::default()
                },
                UpdateOptions::skip_generators(),
            )
            .await?;

        let add = self.build_static_add_command(&port_config)?;
        let del = self.build_static_del_command(&port_config.name);
        let (forward, undo) = command_pair(&add, &del);
        self.activity
            .execute_activity(tx, tags::EXEC_COMMAND, "program hub port", forward, undo)
            .await?;

        Ok(())
    }

    /// Remove the hub WAN port and its programmed address.
    async fn delete_hub_port(&self, tx: &Arc<Transaction>) -> Result<()> {
        let old = self.config.get_config()?;
        let old_port = old
            .port
            .as_ref()
            .and_then(|section| section.port_configs.first().cloned());

        self.config
            .update_config_with_tx(
                tx,
                &DeviceConfig {
                    port: Some(PortSection::default()),
                    ..DeviceConfig::default()
                },
                UpdateOptions::skip_generators(),
            )
            .await?;

        if let Some(old_port) = old_port {
            let del = self.build_static_del_command(&old_port.name);
            let add = self.build_static_add_command(&old_port)?;
            let (forward, undo) = command_pair(&del, &add);
            self.activity
                .execute_activity(tx, tags::EXEC_COMMAND, "clear hub port", forward, undo)
                .await?;
        }

        Ok(())
    }

    fn build_static_add_command(&self, port: &PortConfig) -> Result<String> {
        let wan = port
            .wan
            .as_ref()
            .ok_or_else(|| ControlError::BadRequest("port has no wan config".to_string()))?;

        let prefix = mask_to_prefix(&wan.subnet_mask)?;
        let mut command = format!(
            "{} port static add -n {} -i {}/{prefix} -g {} -t {STATIC_ROUTE_TABLE}",
            self.cli, port.name, wan.ip_addr, wan.gateway
        );
        if !wan.dns.is_empty() {
            command.push_str(&format!(" -d {}", wan.dns));
        }

        Ok(command)
    }

    fn build_static_del_command(&self, port_name: &str) -> String {
        format!("{} port static del -n {port_name}", self.cli)
    }
}

fn mask_to_prefix(mask: &str) -> Result<u32> {
    let addr: std::net::Ipv4Addr = mask
        .parse()
        .map_err(|_| ControlError::BadRequest(format!("invalid subnet mask {mask}")))?;

    let bits = u32::from(addr);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix) != Some(0) && prefix != 32 {
        return Err(ControlError::BadRequest(format!(
            "non-contiguous subnet mask {mask}"
        )));
    }

    Ok(prefix)
}

#[async_trait]
impl StateHandler for ZtpSetupHandler {
    fn state_id(&self) -> AppState {
        AppState::ZtpSetup
    }

    fn validate_transition(&self, from: AppState) -> Result<()> {
        match from {
            AppState::Init | AppState::Boot => Ok(()),
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
                tracing::error!("ztp setup was interrupted");
                Ok(Some(Transition::OnZtpSetupInterrupted))
            }

            Transition::OnZtpSetupConfig(value) => {
                tracing::info!(state = %self.state_id(), "ztp setup config transition");
                self.setup_ztp_config(tx, value).await?;
                Ok(Some(Transition::OnZtpSetupFinished))
            }

            Transition::OnHubSetPort(value) => {
                tracing::info!(state = %self.state_id(), "hub set port transition");
                self.set_hub_port(tx, value).await?;
                Ok(Some(Transition::OnZtpSetupFinished))
            }

            Transition::OnHubDeletePort => {
                tracing::info!(state = %self.state_id(), "hub delete port transition");
                self.delete_hub_port(tx).await?;
                Ok(Some(Transition::OnZtpSetupFinished))
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
