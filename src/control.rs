//! Runtime control surface
//!
//! Requests travel to the orchestrator loop over an `mpsc` channel and are
//! answered on a `oneshot`, so they are serialized with discovery events.

use crate::engine::{NeighborEntry, TopologyState};
use crate::lifecycle::LifecycleState;
use crate::rules::{Layer, RuleLedger, Verdict};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum ControlRequest {
    EnableDefaultRoute {
        reply: oneshot::Sender<Result<()>>,
    },
    SendDiscoveryProbe {
        reply: oneshot::Sender<Result<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    /// Flush everything and exit
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// OUTPUT policy per layer as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputPolicy {
    pub ip: Verdict,
    pub frame: Verdict,
    pub arp: Verdict,
}

impl OutputPolicy {
    pub fn from_ledger(ledger: &RuleLedger) -> Self {
        Self {
            ip: ledger.effective_policy(Layer::Ip),
            frame: ledger.effective_policy(Layer::Frame),
            arp: ledger.effective_policy(Layer::Arp),
        }
    }
}

/// Whether locally generated traffic may leave one interface, per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceOutput {
    pub ip: bool,
    pub frame: bool,
    pub arp: bool,
}

impl InterfaceOutput {
    pub fn from_ledger(ledger: &RuleLedger, iface: &str) -> Self {
        Self {
            ip: ledger.permits_output(Layer::Ip, iface),
            frame: ledger.permits_output(Layer::Frame, iface),
            arp: ledger.permits_output(Layer::Arp, iface),
        }
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub lifecycle: LifecycleState,
    pub topology: TopologyState,
    pub neighbors: Vec<NeighborEntry>,
    pub output_policy: OutputPolicy,
    /// Output permission on the bridge and its members
    pub mitm_output: BTreeMap<String, InterfaceOutput>,
    pub ledger_entries: usize,
    /// Client-bound SNAT rules waiting for the client IP
    pub deferred_client_rules: bool,
    pub counters: BTreeMap<String, u64>,
}

/// Cloneable sender side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<ControlRequest>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// Replace the default route with one via the virtual gateway.
    pub async fn enable_default_route(&self) -> Result<()> {
        self.request(|reply| ControlRequest::EnableDefaultRoute { reply })
            .await?
    }

    /// Returns `false` when the client is not known yet.
    pub async fn send_discovery_probe(&self) -> Result<bool> {
        self.request(|reply| ControlRequest::SendDiscoveryProbe { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| ControlRequest::Snapshot { reply }).await
    }

    /// Resolves once teardown has finished.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ControlRequest::Shutdown { reply }).await
    }
}

/// Bare-word commands accepted on the event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedCommand {
    Route,
    Probe,
    Info,
    Quit,
}

impl FeedCommand {
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim() {
            "route" => Some(FeedCommand::Route),
            "probe" => Some(FeedCommand::Probe),
            "info" => Some(FeedCommand::Info),
            "quit" => Some(FeedCommand::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Intent, Outcome};

    #[test]
    fn test_feed_command_parse() {
        assert_eq!(FeedCommand::parse("route"), Some(FeedCommand::Route));
        assert_eq!(FeedCommand::parse(" quit \n"), Some(FeedCommand::Quit));
        assert_eq!(FeedCommand::parse("reboot"), None);
    }

    #[test]
    fn test_output_policy_from_ledger() {
        let mut ledger = RuleLedger::new();
        ledger.record(
            Intent::SetOutputPolicy {
                layer: Layer::Arp,
                verdict: Verdict::Drop,
            },
            Outcome::Applied,
        );
        let policy = OutputPolicy::from_ledger(&ledger);
        assert_eq!(policy.arp, Verdict::Drop);
        assert_eq!(policy.ip, Verdict::Accept);
        assert_eq!(
            serde_json::to_value(policy).unwrap(),
            serde_json::json!({"ip": "ACCEPT", "frame": "ACCEPT", "arp": "DROP"})
        );
    }

    #[test]
    fn test_interface_output_from_ledger() {
        let mut ledger = RuleLedger::new();
        for layer in Layer::ALL {
            ledger.record(
                Intent::SetOutputPolicy {
                    layer,
                    verdict: Verdict::Drop,
                },
                Outcome::Applied,
            );
        }
        ledger.record(
            Intent::AllowOutput {
                layer: Layer::Frame,
                iface: "lan0".into(),
            },
            Outcome::Applied,
        );

        let lan0 = InterfaceOutput::from_ledger(&ledger, "lan0");
        assert_eq!(
            lan0,
            InterfaceOutput {
                ip: false,
                frame: true,
                arp: false
            }
        );
        let lan1 = InterfaceOutput::from_ledger(&ledger, "lan1");
        assert!(!lan1.ip && !lan1.frame && !lan1.arp);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_running() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ControlHandle::new(tx);
        assert!(matches!(handle.snapshot().await, Err(Error::NotRunning)));
    }
}
