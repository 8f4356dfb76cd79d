use crate::config::ResolutionPolicy;
use crate::exec::{Action, CommandRunner, Executor};
use crate::net::MacAddr;
use crate::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Maps a source MAC to the bridge member it was learned on.
///
/// The answer comes from the live forwarding database and can change as
/// entries age out. With [`ResolutionPolicy::Once`] the first answer sticks.
#[derive(Debug)]
pub struct BridgePortResolver {
    bridge: String,
    policy: ResolutionPolicy,
    resolved: HashMap<MacAddr, String>,
}

impl BridgePortResolver {
    pub fn new(bridge: impl Into<String>, policy: ResolutionPolicy) -> Self {
        Self {
            bridge: bridge.into(),
            policy,
            resolved: HashMap::new(),
        }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Member interface carrying `mac`, or `None` if the bridge has not
    /// learned it yet.
    pub async fn resolve<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        mac: MacAddr,
    ) -> Result<Option<String>> {
        if self.policy == ResolutionPolicy::Once {
            if let Some(name) = self.resolved.get(&mac) {
                return Ok(Some(name.clone()));
            }
        }

        let macs = exec
            .run(
                &format!("Look up bridge port for {}", mac),
                Action::exec("brctl", ["showmacs", self.bridge.as_str()]),
            )
            .await?;
        let Some(port) = parse_showmacs(&macs, mac) else {
            warn!(mac = %mac, bridge = %self.bridge, "MAC not in bridge forwarding table");
            return Ok(None);
        };

        let stp = exec
            .run(
                &format!("Look up interface for bridge port {}", port),
                Action::exec("brctl", ["showstp", self.bridge.as_str()]),
            )
            .await?;
        let Some(name) = parse_showstp(&stp, port) else {
            warn!(port, bridge = %self.bridge, "bridge port has no interface");
            return Ok(None);
        };

        debug!(mac = %mac, port, iface = %name, "resolved bridge port");
        self.resolved.insert(mac, name.clone());
        Ok(Some(name))
    }
}

/// Port number of the `brctl showmacs` row whose MAC column equals `mac`.
pub fn parse_showmacs(output: &str, mac: MacAddr) -> Option<u16> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let port = fields.next()?.parse::<u16>().ok()?;
        let row_mac = fields.next()?.parse::<MacAddr>().ok()?;
        (row_mac == mac).then_some(port)
    })
}

/// Interface name from the first `brctl showstp` line of the form
/// `<ifname> (<port>)`.
pub fn parse_showstp(output: &str, port: u16) -> Option<String> {
    let tag = format!("({})", port);
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let number = fields.next()?;
        (number == tag && fields.next().is_none()).then(|| name.to_string())
    })
}
