//! Wire and filesystem constants shared by the agent crates.

use std::time::Duration;

/// Message-bus subjects.
pub mod mq {
    /// Inbound: run the first setup (ZTP).
    pub const AGENT_ZTP_FIRST_SETUP: &str = "agent.ztp.first_setup";
    /// Inbound: configure the WAN port during ZTP.
    pub const AGENT_ZTP_SET_PORT: &str = "agent.ztp.set_port";
    /// Inbound: remove the WAN port during ZTP.
    pub const AGENT_ZTP_DEL_PORT: &str = "agent.ztp.del_port";
    /// Inbound: read the full device configuration.
    pub const AGENT_GET_CONFIG: &str = "agent.get_config";
    /// Inbound: rebuild all service objects.
    pub const AGENT_REBUILD_SERVICES: &str = "agent.rebuild_services";
    /// Inbound: the update manager finished an installation.
    pub const AGENT_INSTALL_FINISHED: &str = "agent.install_finished";
    /// Inbound: factory reset.
    pub const AGENT_RESET: &str = "agent.reset";
    /// Inbound: configure the hub WAN port.
    pub const AGENT_HUB_SET_PORT: &str = "agent.hub.set_port";
    /// Inbound: remove the hub WAN port.
    pub const AGENT_HUB_DEL_PORT: &str = "agent.hub.del_port";
    /// Inbound: list hub ports.
    pub const AGENT_HUB_LIST_PORTS: &str = "agent.hub.list_ports";
    /// Inbound: initialize the hub.
    pub const AGENT_HUB_INIT: &str = "agent.hub.init";
    /// Inbound: dump heap statistics.
    pub const AGENT_DEBUG_DUMP_HEAP: &str = "agent.debug.dump_heap";

    /// Outbound: download device packages.
    pub const UPDATE_MANAGER_DOWNLOAD: &str = "update_manager.download";
    /// Outbound: install device packages.
    pub const UPDATE_MANAGER_INSTALL: &str = "update_manager.install";
    /// Outbound: query installed package versions.
    pub const UPDATE_MANAGER_GET_VERSIONS: &str = "update_manager.get_versions";
}

/// Websocket methods.
pub mod ws {
    use super::Duration;

    /// Inbound: apply a full configuration update.
    pub const METHOD_UPDATE_ALL_CONFIGS: &str = "update_all_configs";
    /// Inbound: initialize the device.
    pub const METHOD_INIT_DEVICE: &str = "init_device";
    /// Inbound: report the live app state.
    pub const METHOD_GET_AGENT_STATE: &str = "get_agent_state";
    /// Inbound: download device packages.
    pub const METHOD_DOWNLOAD_DEVICE_PACKAGES: &str = "download_device_packages";
    /// Inbound: install device packages.
    pub const METHOD_INSTALL_DEVICE_PACKAGES: &str = "install_device_packages";
    /// Inbound: query installed package versions.
    pub const METHOD_GET_PACKAGES_VERSIONS: &str = "get_packages_versions";

    /// Outbound: an uplink changed state.
    pub const METHOD_UPLINK_STATE_CHANGED: &str = "uplink_state_changed";
    /// Outbound: device initialization finished.
    pub const METHOD_INIT_DEVICE_FINISHED: &str = "init_device_finished";
    /// Outbound: configuration update finished.
    pub const METHOD_UPDATE_ALL_CONFIGS_FINISHED: &str = "update_all_configs_finished";
    /// Outbound: package installation finished.
    pub const METHOD_INSTALL_DEVICE_PACKAGES_FINISHED: &str =
        "install_device_packages_finished";

    /// Recipient id of the orchestrator on the websocket channel.
    pub const ORCHESTRATOR_ID: &str = "main_orchestrator";

    /// Interval between keepalive pings.
    pub const PING_PERIOD: Duration = Duration::from_secs(4);
    /// Deadline for the pong after a ping.
    pub const PONG_WAIT: Duration = Duration::from_secs(6);
}

/// Filesystem locations the agent owns or edits.
pub mod paths {
    /// Embedded KV store directory.
    pub const AGENT_CONFIG: &str = "/etc/sdwan/agent-config";
    /// Agent bootstrap environment file, blanked on factory reset.
    pub const AGENT_ENV: &str = "/etc/sdwan/agent.env";
    /// Default log file.
    pub const DEFAULT_LOG_FILE: &str = "/var/log/sdwan/sdwan_agent.log";
    /// Per-interface configuration files.
    pub const NETWORK_INTERFACES_DIR: &str = "/etc/network/interfaces.d";
    /// Hosts file pinned with orchestrator addresses.
    pub const ETC_HOSTS: &str = "/etc/hosts";
}

/// Systemd units the agent drives.
pub mod services {
    /// Update-manager sidecar unit.
    pub const UPDATE_MANAGER: &str = "sdwan-update-manager";
    /// First-boot starter unit, stopped once the device is adopted.
    pub const AGENT_STARTER: &str = "sdwan-agent-starter";
    /// ISC DHCP server used during ZTP on CPE devices.
    pub const ISC_DHCP: &str = "isc-dhcp-server";
    /// BGP adapter unit.
    pub const BGP_ADAPTER: &str = "sdwan-bgp-adapter";
}

/// Package names recognized during device updates.
pub mod packages {
    /// The agent itself.
    pub const AGENT: &str = "sdwan-agent";
    /// The BGP adapter.
    pub const BGP_ADAPTER: &str = "sdwan-bgp-adapter";
    /// The BGP daemon.
    pub const BGPD: &str = "sdwan-bgpd";
    /// The update manager.
    pub const UPDATE_MANAGER: &str = "sdwan-update-manager";
}

/// Service CLI the agent shells out to for network programming.
pub const CLI_EXECUTABLE: &str = "sdwan-cli-ext";
