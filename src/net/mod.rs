//! Strict address types
//!
//! Every MAC, IP and interface name that ends up in a command argument
//! passes through one of these types first. Learned values come off the
//! wire, so nothing is interpolated from raw strings.

mod cidr;
mod mac;

pub use cidr::{Ipv4Cidr, PortRange, PRIVATE_BLOCKS};
pub use mac::{EtherType, MacAddr, ParseMacAddrError};

/// Maximum length of a Linux network device name (IFNAMSIZ - 1).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// Check that `name` is a plausible Linux network device name.
pub fn validate_device_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
        return Err("device name length must be between 1 and 15 characters");
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Err("device name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_device_name() {
        assert!(validate_device_name("lan0").is_ok());
        assert!(validate_device_name("dolos_bridge").is_ok());
        assert!(validate_device_name("eth0.100").is_ok());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("a_name_far_too_long").is_err());
        assert!(validate_device_name("lan0; reboot").is_err());
        assert!(validate_device_name("lan0$(id)").is_err());
    }
}
