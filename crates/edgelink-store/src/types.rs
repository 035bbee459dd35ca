//! The section-addressed device configuration.
//!
//! A [`DeviceConfig`] is a rooted record of independent, nullable sections.
//! Sections are compared by deep value equality; the agent-owned sections
//! (`app`, `app_state`, `port`, `pony`) are typed, while the per-domain
//! service sections stay opaque object lists interpreted by their rule
//! generators.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Identity of a configuration section inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Device identity and orchestrator addresses.
    App,
    /// Persisted controller state.
    AppState,
    /// WAN/LAN port configuration.
    Port,
    /// Per-port MTU overrides.
    PortMtu,
    /// Administrative port states.
    AdminState,
    /// WAN protection rules.
    WanProtection,
    /// Loopback addresses.
    Loopback,
    /// Policy-routing rules.
    IpRule,
    /// Wireguard tunnel configuration.
    Wireguard,
    /// Tunnel-cluster monitoring.
    Pony,
    /// Trunk service objects.
    Trunk,
    /// L3/BGP service objects.
    L3,
    /// ISB service objects.
    Isb,
    /// Bridge service objects.
    Bridge,
    /// Point-to-point service objects.
    P2p,
    /// Firewall service objects.
    Fw,
    /// DHCP service objects.
    Dhcp,
}

impl SectionKind {
    /// Every section, in storage order.
    pub const ALL: [Self; 17] = [
        Self::App,
        Self::AppState,
        Self::Port,
        Self::PortMtu,
        Self::AdminState,
        Self::WanProtection,
        Self::Loopback,
        Self::IpRule,
        Self::Wireguard,
        Self::Pony,
        Self::Trunk,
        Self::L3,
        Self::Isb,
        Self::Bridge,
        Self::P2p,
        Self::Fw,
        Self::Dhcp,
    ];

    /// Storage key of this section.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::AppState => "app_state",
            Self::Port => "port",
            Self::PortMtu => "port_mtu",
            Self::AdminState => "admin_state",
            Self::WanProtection => "wan_protection",
            Self::Loopback => "loopback",
            Self::IpRule => "ip_rule",
            Self::Wireguard => "wireguard",
            Self::Pony => "pony",
            Self::Trunk => "trunk",
            Self::L3 => "l3",
            Self::Isb => "isb",
            Self::Bridge => "bridge",
            Self::P2p => "p2p",
            Self::Fw => "fw",
            Self::Dhcp => "dhcp",
        }
    }

    /// Parse a storage key.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device identity and orchestrator addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSection {
    /// Serial number assigned at first setup.
    #[serde(default)]
    pub serial_number: String,
    /// Candidate orchestrator base URLs.
    #[serde(default)]
    pub orchestrator_addrs: Vec<String>,
    /// Orchestrator the publisher is currently bound to.
    #[serde(default)]
    pub active_orchestrator_addr: String,
    /// Address of the orchestrator tunnel endpoint.
    #[serde(default)]
    pub orchestrator_tunnel_addr: String,
}

/// Persisted controller state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateSection {
    /// One of the seven app states; empty on a fresh device.
    #[serde(default)]
    pub state: String,
}

/// WAN addressing mode of a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WanMode {
    /// Address acquired over DHCP.
    #[default]
    Dhcp,
    /// Statically configured address.
    Static,
}

/// WAN addressing of a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WanConfig {
    /// Addressing mode.
    #[serde(default)]
    pub mode: WanMode,
    /// Static IP address.
    #[serde(default)]
    pub ip_addr: String,
    /// Static subnet mask.
    #[serde(default)]
    pub subnet_mask: String,
    /// Static gateway.
    #[serde(default)]
    pub gateway: String,
    /// Static DNS server.
    #[serde(default)]
    pub dns: String,
}

/// Configuration of a single port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    /// Interface name, e.g. `port1`.
    pub name: String,
    /// `wan` or `lan`.
    #[serde(default)]
    pub port_type: String,
    /// WAN addressing, present on WAN ports.
    #[serde(default)]
    pub wan: Option<WanConfig>,
}

/// Port configuration section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSection {
    /// Configured ports.
    #[serde(default)]
    pub port_configs: Vec<PortConfig>,
}

/// A monitored tunnel uplink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uplink {
    /// Uplink name.
    pub name: String,
    /// Address pinged to judge tunnel health.
    #[serde(default)]
    pub monitor_addr: String,
}

/// A cluster of tunnel uplinks sharing a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelCluster {
    /// Cluster network.
    #[serde(default)]
    pub network: String,
    /// Member uplinks.
    #[serde(default)]
    pub uplinks: Vec<Uplink>,
}

/// Tunnel-cluster monitoring section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PonySection {
    /// Monitored clusters.
    #[serde(default)]
    pub clusters: Vec<TunnelCluster>,
}

/// An opaque section holding per-domain service objects.
///
/// The core diffs these by value; rule generators interpret the content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectsSection {
    /// Service objects as the orchestrator sent them.
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// The rooted configuration record.
///
/// Every field is nullable; `None` means the section record is absent from
/// the store. Partial configs used for updates set only the sections they
/// touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identity and orchestrator addressing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<AppSection>,
    /// Persisted controller state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<AppStateSection>,
    /// Port configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSection>,
    /// Per-port MTU overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_mtu: Option<ObjectsSection>,
    /// Administrative port states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state: Option<ObjectsSection>,
    /// WAN protection rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wan_protection: Option<ObjectsSection>,
    /// Loopback addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loopback: Option<ObjectsSection>,
    /// Policy-routing rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_rule: Option<ObjectsSection>,
    /// Wireguard tunnels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<ObjectsSection>,
    /// Tunnel-cluster monitoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pony: Option<PonySection>,
    /// Trunk service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunk: Option<ObjectsSection>,
    /// L3/BGP service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<ObjectsSection>,
    /// ISB service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isb: Option<ObjectsSection>,
    /// Bridge service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ObjectsSection>,
    /// Point-to-point service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p: Option<ObjectsSection>,
    /// Firewall service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw: Option<ObjectsSection>,
    /// DHCP service objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<ObjectsSection>,
}

impl DeviceConfig {
    /// A config with every section present but empty.
    ///
    /// Writing it resets the device: generators see each section change to
    /// its empty value and tear the corresponding objects down.
    #[must_use]
    pub fn empty() -> Self {
        let mut config = Self::default();
        for kind in SectionKind::ALL {
            let _ = config.set_section_value(kind, Some(empty_section_value(kind)));
        }
        config
    }

    /// Kinds of the sections this (partial) config sets.
    #[must_use]
    pub fn touched_sections(&self) -> Vec<SectionKind> {
        SectionKind::ALL
            .into_iter()
            .filter(|kind| self.section_value(*kind).is_some())
            .collect()
    }

    /// The JSON value of a section, `None` when absent.
    #[must_use]
    pub fn section_value(&self, kind: SectionKind) -> Option<Value> {
        match kind {
            SectionKind::App => self.app.as_ref().map(to_value),
            SectionKind::AppState => self.app_state.as_ref().map(to_value),
            SectionKind::Port => self.port.as_ref().map(to_value),
            SectionKind::PortMtu => self.port_mtu.as_ref().map(to_value),
            SectionKind::AdminState => self.admin_state.as_ref().map(to_value),
            SectionKind::WanProtection => self.wan_protection.as_ref().map(to_value),
            SectionKind::Loopback => self.loopback.as_ref().map(to_value),
            SectionKind::IpRule => self.ip_rule.as_ref().map(to_value),
            SectionKind::Wireguard => self.wireguard.as_ref().map(to_value),
            SectionKind::Pony => self.pony.as_ref().map(to_value),
            SectionKind::Trunk => self.trunk.as_ref().map(to_value),
            SectionKind::L3 => self.l3.as_ref().map(to_value),
            SectionKind::Isb => self.isb.as_ref().map(to_value),
            SectionKind::Bridge => self.bridge.as_ref().map(to_value),
            SectionKind::P2p => self.p2p.as_ref().map(to_value),
            SectionKind::Fw => self.fw.as_ref().map(to_value),
            SectionKind::Dhcp => self.dhcp.as_ref().map(to_value),
        }
    }

    /// Set a section from its JSON value; `None` clears the section.
    ///
    /// # Errors
    ///
    /// Returns an error when the value does not decode into the section's
    /// schema.
    pub fn set_section_value(&mut self, kind: SectionKind, value: Option<Value>) -> Result<()> {
        match kind {
            SectionKind::App => self.app = decode(value)?,
            SectionKind::AppState => self.app_state = decode(value)?,
            SectionKind::Port => self.port = decode(value)?,
            SectionKind::PortMtu => self.port_mtu = decode(value)?,
            SectionKind::AdminState => self.admin_state = decode(value)?,
            SectionKind::WanProtection => self.wan_protection = decode(value)?,
            SectionKind::Loopback => self.loopback = decode(value)?,
            SectionKind::IpRule => self.ip_rule = decode(value)?,
            SectionKind::Wireguard => self.wireguard = decode(value)?,
            SectionKind::Pony => self.pony = decode(value)?,
            SectionKind::Trunk => self.trunk = decode(value)?,
            SectionKind::L3 => self.l3 = decode(value)?,
            SectionKind::Isb => self.isb = decode(value)?,
            SectionKind::Bridge => self.bridge = decode(value)?,
            SectionKind::P2p => self.p2p = decode(value)?,
            SectionKind::Fw => self.fw = decode(value)?,
            SectionKind::Dhcp => self.dhcp = decode(value)?,
        }
        Ok(())
    }

    /// Overlay the sections set in `partial` onto this config.
    ///
    /// # Errors
    ///
    /// Returns an error when a section value does not decode.
    pub fn merge_from(&mut self, partial: &Self) -> Result<()> {
        for kind in partial.touched_sections() {
            self.set_section_value(kind, partial.section_value(kind))?;
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(section: &T) -> Value {
    serde_json::to_value(section).unwrap_or(Value::Null)
}

fn decode<T: serde::de::DeserializeOwned>(value: Option<Value>) -> Result<Option<T>> {
    match value {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

fn empty_section_value(kind: SectionKind) -> Value {
    match kind {
        SectionKind::App => to_value(&AppSection::default()),
        SectionKind::AppState => to_value(&AppStateSection::default()),
        SectionKind::Port => to_value(&PortSection::default()),
        SectionKind::Pony => to_value(&PonySection::default()),
        _ => to_value(&ObjectsSection::default()),
    }
}
