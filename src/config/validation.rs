//! Configuration validation

use super::{Config, Settings};
use crate::net::validate_device_name;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for err in &self.errors {
            println!("[ERROR] {}", err);
        }
    }

    pub fn log_diagnostics(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }
        for err in &self.errors {
            error!("{}", err);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_bridge(config, &mut result);
    validate_addressing(config, &mut result);
    validate_autorun(config, &mut result);
    validate_system(config, &mut result);

    result
}

fn validate_bridge(config: &Config, result: &mut ValidationResult) {
    let bridge = &config.bridge;

    if let Err(msg) = validate_device_name(&bridge.name) {
        result.error(format!("bridge.name: {}", msg));
    }

    let members = [
        ("bridge.switch_interface", &bridge.switch_interface),
        ("bridge.supplicant_interface", &bridge.supplicant_interface),
    ];
    for (key, member) in members {
        match member {
            None => result.error(format!("{}: required", key)),
            Some(name) => {
                if let Err(msg) = validate_device_name(name) {
                    result.error(format!("{}: {}", key, msg));
                } else if *name == bridge.name {
                    result.error(format!("{}: must differ from the bridge name", key));
                }
            }
        }
    }

    if let (Some(a), Some(b)) = (&bridge.switch_interface, &bridge.supplicant_interface) {
        if a == b {
            result.error("bridge: switch_interface and supplicant_interface must differ");
        }
    }

    if !bridge.mac.is_unicast() || bridge.mac.is_zero() {
        result.error(format!("bridge.mac: {} is not a usable unicast address", bridge.mac));
    }
}

fn validate_addressing(config: &Config, result: &mut ValidationResult) {
    let bridge = &config.bridge;

    if !bridge.apipa_subnet.contains(bridge.apipa_ip) {
        result.warn(format!(
            "bridge.apipa_ip: {} is outside apipa_subnet {}",
            bridge.apipa_ip, bridge.apipa_subnet
        ));
    }

    if !bridge.apipa_subnet.contains(config.nat.virtual_gateway_ip) {
        result.warn(format!(
            "nat.virtual_gateway_ip: {} is outside apipa_subnet {}, the bridge may not reach it on-link",
            config.nat.virtual_gateway_ip, bridge.apipa_subnet
        ));
    }

    if config.nat.virtual_gateway_ip == bridge.apipa_ip {
        result.error("nat.virtual_gateway_ip: must differ from bridge.apipa_ip");
    }

    match config.attacker.subnet {
        None => result.error("attacker.subnet: required"),
        Some(subnet) => {
            if subnet.contains(bridge.apipa_ip) {
                result.error(format!(
                    "attacker.subnet: {} overlaps the bridge's own address {}",
                    subnet, bridge.apipa_ip
                ));
            }
        }
    }
}

fn validate_autorun(config: &Config, result: &mut ValidationResult) {
    let autorun = &config.autorun;
    if autorun.enabled && autorun.command.is_empty() {
        result.error("autorun.command: required when autorun.enabled = true");
    }
    if !autorun.enabled && !autorun.command.is_empty() {
        result.warn("autorun.command: set but autorun.enabled = false, it will not run");
    }
}

fn validate_system(config: &Config, result: &mut ValidationResult) {
    if config.system.command_timeout_secs == 0 {
        result.error("system.command_timeout_secs: must be greater than zero");
    }
    if config.discovery.probe_tool.as_os_str().is_empty() {
        result.warn("discovery.probe_tool: empty, discovery probes will fail");
    }
}

impl Settings {
    /// Validate `config` and resolve it into settings.
    ///
    /// Warnings are logged; any error aborts with [`Error::Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let validation = validate(config);
        validation.log_diagnostics();
        if validation.has_errors() {
            return Err(Error::Config(validation.errors.join("; ")));
        }

        let missing = |what: &str| Error::Config(format!("{} is required", what));

        Ok(Settings {
            bridge: config.bridge.name.clone(),
            bridge_apipa_subnet: config.bridge.apipa_subnet,
            bridge_apipa_ip: config.bridge.apipa_ip,
            bridge_mac: config.bridge.mac,
            switch_interface: config
                .bridge
                .switch_interface
                .clone()
                .ok_or_else(|| missing("bridge.switch_interface"))?,
            supplicant_interface: config
                .bridge
                .supplicant_interface
                .clone()
                .ok_or_else(|| missing("bridge.supplicant_interface"))?,
            attacker_subnet: config
                .attacker
                .subnet
                .ok_or_else(|| missing("attacker.subnet"))?,
            ephemeral_ports: config.nat.ephemeral_ports,
            virtual_gateway_ip: config.nat.virtual_gateway_ip,
            replace_default_route: config.routing.replace_default_route,
            autorun_command: config
                .autorun
                .enabled
                .then(|| config.autorun.command.clone()),
            externally_managed: config.interfaces.externally_managed,
            resolution: config.discovery.resolution,
            probe_tool: config.discovery.probe_tool.clone(),
            sysfs_root: config.system.sysfs_root.clone(),
            resolv_conf: config.system.resolv_conf.clone(),
            command_timeout: Duration::from_secs(config.system.command_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[bridge]
switch_interface = "lan0"
supplicant_interface = "lan1"

[attacker]
subnet = "172.16.100.0/24"
"#;

    #[test]
    fn test_minimal_config_is_valid() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let result = validate(&config);
        assert!(!result.has_errors(), "errors: {:?}", result.errors);
        assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    }

    #[test]
    fn test_missing_members_and_attacker_subnet() {
        let config = Config::default();
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("switch_interface")));
        assert!(result.errors.iter().any(|e| e.contains("supplicant_interface")));
        assert!(result.errors.iter().any(|e| e.contains("attacker.subnet")));
    }

    #[test]
    fn test_duplicate_members() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.bridge.supplicant_interface = Some("lan0".into());
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("must differ")));
    }

    #[test]
    fn test_member_named_like_bridge() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.bridge.switch_interface = Some("dolos_bridge".into());
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("must differ from the bridge name")));
    }

    #[test]
    fn test_invalid_device_name() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.bridge.switch_interface = Some("lan0 && rm".into());
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("invalid characters")));
    }

    #[test]
    fn test_autorun_enabled_without_command() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.autorun.enabled = true;
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("autorun.command")));
    }

    #[test]
    fn test_virtual_gateway_outside_apipa_warns() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.nat.virtual_gateway_ip = "10.9.9.9".parse().unwrap();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("virtual_gateway_ip")));
    }

    #[test]
    fn test_settings_from_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.bridge, "dolos_bridge");
        assert_eq!(settings.members(), ["lan0", "lan1"]);
        assert_eq!(settings.attacker_subnet.to_string(), "172.16.100.0/24");
        assert_eq!(settings.command_timeout, Duration::from_secs(10));
        assert!(settings.autorun_command.is_none());
        assert!(settings.is_mitm_interface("lan1"));
        assert!(!settings.is_mitm_interface("wan"));
    }

    #[test]
    fn test_settings_from_invalid_config() {
        let err = Settings::from_config(&Config::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
