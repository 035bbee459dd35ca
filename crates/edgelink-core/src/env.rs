//! Process environment parsed once at startup.

use crate::consts::paths;
use crate::error::{CoreError, Result};
use crate::state::DeviceRole;

/// Agent settings read from the process environment.
///
/// `SDWAN_DEVICE` is required; everything else has a default or may be
/// empty. `endpoint` and `device_id` carry the bootstrap identity written by
/// a previous agent generation and are blanked by factory reset.
#[derive(Debug, Clone)]
pub struct AgentEnv {
    /// Device role (`cpe` or `hub`).
    pub role: DeviceRole,
    /// Bootstrap orchestrator endpoint, may be empty.
    pub endpoint: String,
    /// Bootstrap device id, may be empty.
    pub device_id: String,
    /// Wireguard configuration root.
    pub wg_config_root: String,
    /// Log file path.
    pub log_file: String,
    /// Log level filter.
    pub log_level: String,
}

impl AgentEnv {
    /// Read the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when `SDWAN_DEVICE` is missing or not `cpe`/`hub`.
    pub fn from_env() -> Result<Self> {
        let role_raw = read("SDWAN_DEVICE");
        if role_raw.is_empty() {
            return Err(CoreError::MissingEnv("SDWAN_DEVICE"));
        }

        let role = DeviceRole::parse(&role_raw).ok_or(CoreError::InvalidEnv {
            name: "SDWAN_DEVICE",
            value: role_raw,
        })?;

        let mut log_file = read("AGENT_LOG_FILE");
        if log_file.is_empty() {
            log_file = paths::DEFAULT_LOG_FILE.to_string();
        }

        let mut log_level = read("AGENT_LOG_LEVEL");
        if log_level.is_empty() {
            log_level = "info".to_string();
        }

        Ok(Self {
            role,
            endpoint: read("AGENT_ENDPOINT"),
            device_id: read("AGENT_ID"),
            wg_config_root: read("AGENT_CFG_ROOT"),
            log_file,
            log_level,
        })
    }

    /// True when the configured log level enables debug output.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.log_level == "debug"
    }
}

fn read(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag() {
        let env = AgentEnv {
            role: DeviceRole::Cpe,
            endpoint: String::new(),
            device_id: String::new(),
            wg_config_root: String::new(),
            log_file: paths::DEFAULT_LOG_FILE.into(),
            log_level: "debug".into(),
        };
        assert!(env.is_debug());
    }
}
