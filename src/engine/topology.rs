use crate::net::MacAddr;
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::warn;

/// One-shot guard for a reaction that must run at most once per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Latch {
    fired: bool,
}

impl Latch {
    /// Returns `true` the first time only.
    pub fn try_fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

/// Facts whose reactions are latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ClientMapping,
    GatewayMapping,
    ClientTtl,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Latches {
    pub client_mapping: Latch,
    pub gateway_mapping: Latch,
    pub client_ttl: Latch,
}

impl Latches {
    pub fn get_mut(&mut self, signal: Signal) -> &mut Latch {
        match signal {
            Signal::ClientMapping => &mut self.client_mapping,
            Signal::GatewayMapping => &mut self.gateway_mapping,
            Signal::ClientTtl => &mut self.client_ttl,
        }
    }
}

/// What has been learned about the two ends of the link.
///
/// Learned identities are written at most once; the resolved interface
/// names may be refreshed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologyState {
    pub gateway_mac: Option<MacAddr>,
    pub gateway_ip: Option<Ipv4Addr>,
    pub client_mac: Option<MacAddr>,
    pub client_ip: Option<Ipv4Addr>,
    pub client_ttl: Option<u8>,
    pub gateway_side_interface: Option<String>,
    pub client_side_interface: Option<String>,
    pub fired: Latches,
}

impl TopologyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the latch for `signal`.
    pub fn claim(&mut self, signal: Signal) -> bool {
        self.fired.get_mut(signal).try_fire()
    }

    pub fn learn_gateway_mac(&mut self, mac: MacAddr) {
        learn("gateway_mac", &mut self.gateway_mac, mac);
    }

    pub fn learn_gateway_ip(&mut self, ip: Ipv4Addr) {
        learn("gateway_ip", &mut self.gateway_ip, ip);
    }

    pub fn learn_client_mac(&mut self, mac: MacAddr) {
        learn("client_mac", &mut self.client_mac, mac);
    }

    pub fn learn_client_ip(&mut self, ip: Ipv4Addr) {
        learn("client_ip", &mut self.client_ip, ip);
    }

    pub fn learn_client_ttl(&mut self, ttl: u8) {
        learn("client_ttl", &mut self.client_ttl, ttl);
    }

    /// The client is probe-ready once both halves of its identity are known.
    pub fn client_identity(&self) -> Option<(MacAddr, Ipv4Addr)> {
        Some((self.client_mac?, self.client_ip?))
    }
}

fn learn<T: PartialEq + std::fmt::Display + Copy>(field: &str, slot: &mut Option<T>, value: T) {
    match slot {
        None => *slot = Some(value),
        Some(existing) if *existing == value => {}
        Some(existing) => {
            warn!(field, kept = %existing, ignored = %value, "conflicting topology fact");
        }
    }
}
