use crate::net::MacAddr;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// A topology fact from the discovery engine.
///
/// Addresses are parsed into strict types during deserialization, so a
/// malformed payload never reaches a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// A host answered ARP on the bridge
    NewArp { ip: Ipv4Addr, mac: MacAddr },
    /// The client's DNS servers, in order of preference
    DnsUpdate { servers: Vec<IpAddr> },
    /// Client identity plus the MAC it talks to upstream
    #[serde(rename = "client_ip_mac_and_gateway_mac")]
    ClientMapping {
        client_mac: MacAddr,
        client_ip: Ipv4Addr,
        gateway_mac: MacAddr,
    },
    /// Gateway identity plus the MAC it talks to downstream
    #[serde(rename = "gateway_ip_mac_and_client_mac")]
    GatewayMapping {
        gateway_mac: MacAddr,
        gateway_ip: Ipv4Addr,
        client_mac: MacAddr,
    },
    /// TTL the client's packets leave with
    ClientTtl { client_ttl: u8 },
}

impl DiscoveryEvent {
    /// Parse one JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Parse(format!("discovery event: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::NewArp { .. } => "new_arp",
            DiscoveryEvent::DnsUpdate { .. } => "dns_update",
            DiscoveryEvent::ClientMapping { .. } => "client_ip_mac_and_gateway_mac",
            DiscoveryEvent::GatewayMapping { .. } => "gateway_ip_mac_and_client_mac",
            DiscoveryEvent::ClientTtl { .. } => "client_ttl",
        }
    }
}

/// Notification broadcast after a fact is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeUpdate {
    NewArp {
        ip: Ipv4Addr,
        mac: MacAddr,
    },
    DnsUpdate {
        servers: Vec<IpAddr>,
    },
    Cimagm {
        client_mac: MacAddr,
        client_ip: Ipv4Addr,
        gateway_mac: MacAddr,
    },
    Gimacm {
        gateway_mac: MacAddr,
        gateway_ip: Ipv4Addr,
        client_mac: MacAddr,
    },
    ClientTtl {
        client_ttl: u8,
    },
}

impl From<&DiscoveryEvent> for BridgeUpdate {
    fn from(event: &DiscoveryEvent) -> Self {
        match event.clone() {
            DiscoveryEvent::NewArp { ip, mac } => BridgeUpdate::NewArp { ip, mac },
            DiscoveryEvent::DnsUpdate { servers } => BridgeUpdate::DnsUpdate { servers },
            DiscoveryEvent::ClientMapping {
                client_mac,
                client_ip,
                gateway_mac,
            } => BridgeUpdate::Cimagm {
                client_mac,
                client_ip,
                gateway_mac,
            },
            DiscoveryEvent::GatewayMapping {
                gateway_mac,
                gateway_ip,
                client_mac,
            } => BridgeUpdate::Gimacm {
                gateway_mac,
                gateway_ip,
                client_mac,
            },
            DiscoveryEvent::ClientTtl { client_ttl } => BridgeUpdate::ClientTtl { client_ttl },
        }
    }
}
