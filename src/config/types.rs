//! Configuration types

use crate::net::{Ipv4Cidr, MacAddr, PortRange};
use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub attacker: AttackerConfig,
    #[serde(default)]
    pub nat: NatConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub autorun: AutorunConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// The MITM bridge and its two physical members.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_name")]
    pub name: String,
    /// Link-local subnet the bridge uses for its own identity
    #[serde(default = "default_apipa_subnet")]
    pub apipa_subnet: Ipv4Cidr,
    #[serde(default = "default_apipa_ip")]
    pub apipa_ip: Ipv4Addr,
    #[serde(default = "default_bridge_mac")]
    pub mac: MacAddr,
    /// Member facing the 802.1x switch
    pub switch_interface: Option<String>,
    /// Member facing the trusted supplicant
    pub supplicant_interface: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            apipa_subnet: default_apipa_subnet(),
            apipa_ip: default_apipa_ip(),
            mac: default_bridge_mac(),
            switch_interface: None,
            supplicant_interface: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttackerConfig {
    /// Subnet the attacker machines live on, e.g. 172.16.100.0/24
    pub subnet: Option<Ipv4Cidr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    #[serde(default)]
    pub ephemeral_ports: PortRange,
    #[serde(default = "default_virtual_gateway")]
    pub virtual_gateway_ip: Ipv4Addr,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            ephemeral_ports: PortRange::default(),
            virtual_gateway_ip: default_virtual_gateway(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    /// Make the virtual gateway this device's default route
    #[serde(default)]
    pub replace_default_route: bool,
}

/// Command run once the device first gains network access.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutorunConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Program followed by its arguments; never passed through a shell
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfacesConfig {
    /// Detach the members from NetworkManager while running
    #[serde(default)]
    pub externally_managed: bool,
}

/// Whether a resolved MAC-to-port mapping may be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionPolicy {
    /// Resolve on first use, reuse afterwards
    #[default]
    Once,
    /// Query the bridge tables on every lookup
    Always,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Tool that sends a DHCP discover while spoofing the client
    #[serde(default = "default_probe_tool")]
    pub probe_tool: PathBuf,
    #[serde(default)]
    pub resolution: ResolutionPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_tool: default_probe_tool(),
            resolution: ResolutionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            resolv_conf: default_resolv_conf(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Lifetime log, appended across runs
    #[serde(default = "default_history_log")]
    pub history_log: PathBuf,
    /// Session log, truncated at start
    #[serde(default = "default_session_log")]
    pub session_log: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            history_log: default_history_log(),
            session_log: default_session_log(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_bridge_name() -> String {
    "dolos_bridge".to_string()
}

fn default_apipa_subnet() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(169, 254, 0, 0), 16)
}

fn default_apipa_ip() -> Ipv4Addr {
    Ipv4Addr::new(169, 254, 66, 77)
}

fn default_bridge_mac() -> MacAddr {
    MacAddr([0x00, 0x01, 0x01, 0x01, 0x01, 0x01])
}

fn default_virtual_gateway() -> Ipv4Addr {
    Ipv4Addr::new(169, 254, 66, 55)
}

fn default_probe_tool() -> PathBuf {
    PathBuf::from("/root/tools/dolosjs/discovery")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_command_timeout() -> u64 {
    10
}

fn default_history_log() -> PathBuf {
    PathBuf::from("logs/history.log")
}

fn default_session_log() -> PathBuf {
    PathBuf::from("logs/current.log")
}

// ============================================================================
// Resolved settings (validated, every required field present)
// ============================================================================

/// Immutable view of a validated [`Config`], shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bridge: String,
    pub bridge_apipa_subnet: Ipv4Cidr,
    pub bridge_apipa_ip: Ipv4Addr,
    pub bridge_mac: MacAddr,
    pub switch_interface: String,
    pub supplicant_interface: String,
    pub attacker_subnet: Ipv4Cidr,
    pub ephemeral_ports: PortRange,
    pub virtual_gateway_ip: Ipv4Addr,
    pub replace_default_route: bool,
    /// Present only when autorun is enabled
    pub autorun_command: Option<Vec<String>>,
    pub externally_managed: bool,
    pub resolution: ResolutionPolicy,
    pub probe_tool: PathBuf,
    pub sysfs_root: PathBuf,
    pub resolv_conf: PathBuf,
    pub command_timeout: Duration,
}

impl Settings {
    /// The two physical bridge members, switch side first.
    pub fn members(&self) -> [&str; 2] {
        [&self.switch_interface, &self.supplicant_interface]
    }

    /// True for the bridge itself and both of its members.
    pub fn is_mitm_interface(&self, name: &str) -> bool {
        name == self.bridge || self.members().contains(&name)
    }
}
