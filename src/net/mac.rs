//! MAC addresses and the EtherTypes the bridge cares about

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// MAC address (6 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    pub const ZERO: MacAddr = MacAddr([0, 0, 0, 0, 0, 0]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error type for MAC address parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacAddrError {
    kind: ParseMacAddrErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseMacAddrErrorKind {
    Length,
    Format,
    Hex,
}

impl ParseMacAddrError {
    fn new(kind: ParseMacAddrErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for ParseMacAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParseMacAddrErrorKind::Length => write!(f, "invalid MAC address length"),
            ParseMacAddrErrorKind::Format => write!(f, "invalid MAC address format"),
            ParseMacAddrErrorKind::Hex => write!(f, "invalid hex digit in MAC address"),
        }
    }
}

impl std::error::Error for ParseMacAddrError {}

impl FromStr for MacAddr {
    type Err = ParseMacAddrError;

    /// Parse a MAC address from string
    ///
    /// Accepts exactly six two-digit hex octets separated by `:` or `-`.
    /// Surrounding whitespace (as found in sysfs files) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let separator = if s.contains(':') {
            ':'
        } else if s.contains('-') {
            '-'
        } else {
            return Err(ParseMacAddrError::new(ParseMacAddrErrorKind::Format));
        };

        let octets: Vec<&str> = s.split(separator).collect();
        if octets.len() != 6 {
            return Err(ParseMacAddrError::new(ParseMacAddrErrorKind::Length));
        }

        let mut result = [0u8; 6];
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 {
                return Err(ParseMacAddrError::new(ParseMacAddrErrorKind::Format));
            }
            if !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ParseMacAddrError::new(ParseMacAddrErrorKind::Hex));
            }
            result[i] = u8::from_str_radix(octet, 16)
                .map_err(|_| ParseMacAddrError::new(ParseMacAddrErrorKind::Hex))?;
        }

        Ok(MacAddr(result))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// EtherType values that matter on the bridge's OUTPUT path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    FrameRelayArp = 0x0808,
    Rarp = 0x8035,
    AppleTalkArp = 0x80F3,
}

impl EtherType {
    /// Address-resolution EtherTypes that would reveal this device's own
    /// identity if it emitted them.
    pub const IDENTITY_LEAKING: [EtherType; 4] = [
        EtherType::Arp,
        EtherType::FrameRelayArp,
        EtherType::Rarp,
        EtherType::AppleTalkArp,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0800 => Some(EtherType::Ipv4),
            0x0806 => Some(EtherType::Arp),
            0x0808 => Some(EtherType::FrameRelayArp),
            0x8035 => Some(EtherType::Rarp),
            0x80F3 => Some(EtherType::AppleTalkArp),
            _ => None,
        }
    }

    /// Hex form accepted by `ebtables -p`.
    pub fn to_arg(self) -> String {
        format!("0x{:04X}", self as u16)
    }
}
