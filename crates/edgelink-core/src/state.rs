//! App states and the transitions between them.
//!
//! The agent moves through seven operational phases. A [`Transition`] is a
//! typed command carrying the payload the destination state needs; the
//! controller dispatches it to the handler registered for
//! [`Transition::target`].
//!
//! # State machine
//!
//! ```text
//!                 ┌────────┐
//!                 │  boot  │ (initial, pre-recovery)
//!                 └───┬────┘
//!        OnAfterBoot  │  (recorded state)
//!      ┌──────────┬───┴─────┬───────────────┐
//!      ▼          ▼         ▼               ▼
//! ┌────────┐ ┌────────┐ ┌───────────┐ ┌──────────┐
//! │  init  │◄│ztp_setup│ │  active  │◄┤maintenance│
//! └───┬────┘ └────▲───┘ └──┬───┬───┘ └────▲─────┘
//!     │OnZTPSetup │        │   │OnUpdateDevice
//!     └───────────┘        │   └───────────┘
//!                OnUpdate  │
//!                Config    ▼
//!               ┌───────────────┐     ┌───────┐
//!               │ update_config │     │ reset │
//!               └───────────────┘     └───────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operational phase of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// Initial in-memory state before after-boot recovery runs.
    Boot,
    /// Zero-touch provisioning; the device awaits a first setup.
    Init,
    /// Normal operation under an orchestrator.
    Active,
    /// A partial configuration is being applied.
    UpdateConfig,
    /// Device packages are being installed.
    Maintenance,
    /// Provisioning sub-state accepting ZTP commands.
    ZtpSetup,
    /// Factory reset in progress.
    Reset,
}

impl AppState {
    /// Stable string form used in the persisted `app_state` section.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Init => "init",
            Self::Active => "active",
            Self::UpdateConfig => "update_config",
            Self::Maintenance => "maintenance",
            Self::ZtpSetup => "ztp_setup",
            Self::Reset => "reset",
        }
    }

    /// Parse a persisted state string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "boot" => Some(Self::Boot),
            "init" => Some(Self::Init),
            "active" => Some(Self::Active),
            "update_config" => Some(Self::UpdateConfig),
            "maintenance" => Some(Self::Maintenance),
            "ztp_setup" => Some(Self::ZtpSetup),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device role; some state-handler behavior branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Customer-premises edge device.
    Cpe,
    /// Hub device.
    Hub,
}

impl DeviceRole {
    /// Parse the `SDWAN_DEVICE` environment value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpe" => Some(Self::Cpe),
            "hub" => Some(Self::Hub),
            _ => None,
        }
    }
}

/// A typed command to move the controller to a specific state.
///
/// Each variant carries the payload the destination handler needs. The
/// variants that carry opaque configuration use `serde_json::Value` section
/// maps understood by the config store.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Re-enter the recorded state after process start.
    OnAfterBoot(AppState),
    /// First setup from ZTP: device serial plus orchestrator URLs.
    OnFirstSetup {
        /// Serial number assigned to the device.
        serial_number: String,
        /// Orchestrator base URLs (http/https).
        orchestrator_addrs: Vec<String>,
    },
    /// Adopt identity written by a previous agent generation.
    OnMigrateFromOldVersion {
        /// Serial number recovered from the bootstrap environment.
        serial_number: String,
        /// Orchestrator URL recovered from the bootstrap environment.
        orchestrator_addr: String,
    },
    /// Restore `active` after an interrupted operation.
    OnFallback,
    /// Config application finished; return to `active`.
    OnUpdateConfigFinished,
    /// Package installation finished; return to `active`.
    OnUpdateDeviceFinished(Option<String>),
    /// Apply a partial configuration.
    OnUpdateConfig(Value),
    /// Tear down and re-create all service objects.
    OnRebuildServices,
    /// Install device packages.
    OnUpdateDevice(Value),
    /// Factory reset.
    OnReset,
    /// ZTP setup finished; return to `init`.
    OnZtpSetupFinished,
    /// ZTP setup was interrupted by a restart.
    OnZtpSetupInterrupted,
    /// Restore `init` after an interrupted operation.
    OnInitFallback,
    /// Hub reset finished; hubs end in `init`.
    OnHubResetFinished,
    /// Apply a ZTP-stage partial configuration.
    OnZtpSetupConfig(Value),
    /// Configure the hub WAN port during ZTP.
    OnHubSetPort(Value),
    /// Remove the hub WAN port during ZTP.
    OnHubDeletePort,
}

impl Transition {
    /// Destination state of this transition.
    #[must_use]
    pub const fn target(&self) -> AppState {
        match self {
            Self::OnAfterBoot(state) => *state,
            Self::OnFirstSetup { .. }
            | Self::OnMigrateFromOldVersion { .. }
            | Self::OnFallback
            | Self::OnUpdateConfigFinished
            | Self::OnUpdateDeviceFinished(_) => AppState::Active,
            Self::OnUpdateConfig(_) | Self::OnRebuildServices => AppState::UpdateConfig,
            Self::OnUpdateDevice(_) => AppState::Maintenance,
            Self::OnReset => AppState::Reset,
            Self::OnZtpSetupFinished
            | Self::OnZtpSetupInterrupted
            | Self::OnInitFallback
            | Self::OnHubResetFinished => AppState::Init,
            Self::OnZtpSetupConfig(_) | Self::OnHubSetPort(_) | Self::OnHubDeletePort => {
                AppState::ZtpSetup
            }
        }
    }

    /// Short tag used in log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OnAfterBoot(_) => "on_after_boot",
            Self::OnFirstSetup { .. } => "on_first_setup",
            Self::OnMigrateFromOldVersion { .. } => "on_migrate_from_old_version",
            Self::OnFallback => "on_fallback",
            Self::OnUpdateConfigFinished => "on_update_config_finished",
            Self::OnUpdateDeviceFinished(_) => "on_update_device_finished",
            Self::OnUpdateConfig(_) => "on_update_config",
            Self::OnRebuildServices => "on_rebuild_services",
            Self::OnUpdateDevice(_) => "on_update_device",
            Self::OnReset => "on_reset",
            Self::OnZtpSetupFinished => "on_ztp_setup_finished",
            Self::OnZtpSetupInterrupted => "on_ztp_setup_interrupted",
            Self::OnInitFallback => "on_init_fallback",
            Self::OnHubResetFinished => "on_hub_reset_finished",
            Self::OnZtpSetupConfig(_) => "on_ztp_setup_config",
            Self::OnHubSetPort(_) => "on_hub_set_port",
            Self::OnHubDeletePort => "on_hub_delete_port",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            AppState::Boot,
            AppState::Init,
            AppState::Active,
            AppState::UpdateConfig,
            AppState::Maintenance,
            AppState::ZtpSetup,
            AppState::Reset,
        ] {
            assert_eq!(AppState::parse(state.as_str()), Some(state));
        }
        assert_eq!(AppState::parse("rebooting"), None);
    }

    #[test]
    fn transition_targets() {
        assert_eq!(
            Transition::OnFirstSetup {
                serial_number: "SN1".into(),
                orchestrator_addrs: vec!["https://orch.local".into()],
            }
            .target(),
            AppState::Active
        );
        assert_eq!(Transition::OnRebuildServices.target(), AppState::UpdateConfig);
        assert_eq!(Transition::OnReset.target(), AppState::Reset);
        assert_eq!(Transition::OnHubDeletePort.target(), AppState::ZtpSetup);
        assert_eq!(Transition::OnHubResetFinished.target(), AppState::Init);
        assert_eq!(
            Transition::OnAfterBoot(AppState::Maintenance).target(),
            AppState::Maintenance
        );
    }

    #[test]
    fn role_parse() {
        assert_eq!(DeviceRole::parse("cpe"), Some(DeviceRole::Cpe));
        assert_eq!(DeviceRole::parse("hub"), Some(DeviceRole::Hub));
        assert_eq!(DeviceRole::parse("router"), None);
    }
}
