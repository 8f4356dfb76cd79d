//! IPv4 CIDR blocks and NAT port ranges

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// IPv4 CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

/// RFC 1918 private blocks, in the order routes are installed for them.
pub const PRIVATE_BLOCKS: [Ipv4Cidr; 3] = [
    Ipv4Cidr {
        addr: Ipv4Addr::new(10, 0, 0, 0),
        prefix_len: 8,
    },
    Ipv4Cidr {
        addr: Ipv4Addr::new(192, 168, 0, 0),
        prefix_len: 16,
    },
    Ipv4Cidr {
        addr: Ipv4Addr::new(172, 16, 0, 0),
        prefix_len: 12,
    },
];

impl Ipv4Cidr {
    /// Create a new IPv4 CIDR, masking host bits off `addr`
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            addr: Self::network_addr(addr, prefix_len),
            prefix_len,
        }
    }

    /// A /32 covering a single host
    pub fn host(addr: Ipv4Addr) -> Self {
        Self::new(addr, 32)
    }

    /// Parse from string like "192.168.1.0/24"
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.trim().split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        if prefix_len > 32 {
            return None;
        }
        Some(Self::new(addr, prefix_len))
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this CIDR range
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::prefix_to_mask(self.prefix_len);
        (u32::from(self.addr) & mask) == (u32::from(addr) & mask)
    }

    fn network_addr(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(addr) & Self::prefix_to_mask(prefix_len))
    }

    fn prefix_to_mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid IPv4 CIDR: {}", s))
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive source-port range used for TCP/UDP SNAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Create a new port range
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Parse from string like "61000-62000"; rejects inverted ranges
    pub fn parse(s: &str) -> Option<Self> {
        let (start, end) = s.trim().split_once('-')?;
        let start: u16 = start.parse().ok()?;
        let end: u16 = end.parse().ok()?;
        if start == 0 || start > end {
            return None;
        }
        Some(Self::new(start, end))
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Check if a port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(61000, 62000)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid port range: {}", s))
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
