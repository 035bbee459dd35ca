//! Device-facing services the state handlers compose.

pub mod device_init;
pub mod first_port;
pub mod hostname;
pub mod hosts;
pub mod systemd;
pub mod tunnel;
pub mod update_manager;

pub use device_init::{DeviceInitService, InitConfig};
pub use first_port::FirstPortService;
pub use hostname::HostnameService;
pub use hosts::{DnsResolver, HostsSync, Resolver};
pub use systemd::SystemdService;
pub use tunnel::{check_hub_tunnels, PingOptions, Pinger, ShellPinger, TunnelMonitor};
pub use update_manager::{InstallPackageRequest, PackageItem, UpdateManagerService};
