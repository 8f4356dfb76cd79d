use crate::exec::Action;
use crate::net::{EtherType, Ipv4Cidr, MacAddr, PortRange};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Filtering layer, one per userspace tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Ethernet frames (ebtables)
    Frame,
    /// IPv4 packets (iptables)
    Ip,
    /// ARP (arptables)
    Arp,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Frame, Layer::Ip, Layer::Arp];

    pub fn program(self) -> &'static str {
        match self {
            Layer::Frame => "ebtables",
            Layer::Ip => "iptables",
            Layer::Arp => "arptables",
        }
    }

    /// Tables flushed on teardown. `None` means the tool's default table.
    pub fn tables(self) -> &'static [Option<&'static str>] {
        match self {
            Layer::Frame => &[Some("filter"), Some("nat")],
            Layer::Ip => &[Some("filter"), Some("nat"), Some("mangle"), Some("raw")],
            Layer::Arp => &[None],
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Whether SNAT may remap the source port.
    pub fn has_ports(self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDest {
    Default,
    Prefix(Ipv4Cidr),
}

impl fmt::Display for RouteDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDest::Default => f.write_str("default"),
            RouteDest::Prefix(cidr) => write!(f, "{}", cidr),
        }
    }
}

/// A single change to kernel network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    LoadModule {
        name: String,
    },
    /// `-P OUTPUT <verdict>`
    SetOutputPolicy {
        layer: Layer,
        verdict: Verdict,
    },
    /// `-A OUTPUT -o <iface> -j ACCEPT`
    AllowOutput {
        layer: Layer,
        iface: String,
    },
    /// `iptables -A OUTPUT -o <iface> -s <source> -j ACCEPT`
    AllowOutputFrom {
        iface: String,
        source: Ipv4Addr,
    },
    /// `ebtables -A OUTPUT -p <ethertype> -j DROP`
    DropFrameType {
        ethertype: EtherType,
    },
    /// Delete every rule in a table
    Flush {
        layer: Layer,
        table: Option<&'static str>,
    },
    /// Rewrite the source MAC of frames leaving `out_iface`, ARP payload included
    FrameSnat {
        source: MacAddr,
        out_iface: String,
        to: MacAddr,
    },
    /// Rewrite the source address of packets leaving `out_iface`
    Snat {
        out_iface: String,
        source: Ipv4Cidr,
        destination: Option<Ipv4Addr>,
        protocol: Protocol,
        to: Ipv4Addr,
        ports: PortRange,
    },
    /// Rewrite the TTL of every packet leaving `out_iface`
    SetTtl {
        out_iface: String,
        ttl: u8,
    },
    AddNeighbor {
        ip: Ipv4Addr,
        mac: MacAddr,
        dev: String,
    },
    AddRoute {
        dest: RouteDest,
        via: Option<Ipv4Addr>,
        dev: String,
    },
    /// `ip neigh replace`, for an IP whose entry already exists
    ReplaceNeighbor {
        ip: Ipv4Addr,
        mac: MacAddr,
        dev: String,
    },
    ReplaceRoute {
        dest: RouteDest,
        via: Option<Ipv4Addr>,
        dev: String,
    },
    /// `ip route del <selector...>`
    DeleteRoute {
        selector: Vec<String>,
    },
    Sysctl {
        key: String,
        value: String,
    },
    WriteFile {
        path: PathBuf,
        contents: String,
    },
    /// Hand an interface to NetworkManager or take it away
    SetManaged {
        iface: String,
        managed: bool,
    },
}

impl Intent {
    /// Render to a structured action.
    pub fn to_action(&self) -> Action {
        match self {
            Intent::LoadModule { name } => Action::exec("modprobe", [name.as_str()]),
            Intent::SetOutputPolicy { layer, verdict } => {
                Action::exec(layer.program(), ["-P", "OUTPUT", verdict.as_str()])
            }
            Intent::AllowOutput { layer, iface } => Action::exec(
                layer.program(),
                ["-A", "OUTPUT", "-o", iface.as_str(), "-j", "ACCEPT"],
            ),
            Intent::AllowOutputFrom { iface, source } => Action::exec(
                "iptables",
                [
                    "-A".to_string(),
                    "OUTPUT".into(),
                    "-o".into(),
                    iface.clone(),
                    "-s".into(),
                    source.to_string(),
                    "-j".into(),
                    "ACCEPT".into(),
                ],
            ),
            Intent::DropFrameType { ethertype } => Action::exec(
                "ebtables",
                [
                    "-A".to_string(),
                    "OUTPUT".into(),
                    "-p".into(),
                    ethertype.to_arg(),
                    "-j".into(),
                    "DROP".into(),
                ],
            ),
            Intent::Flush { layer, table } => match table {
                Some(table) => Action::exec(layer.program(), ["-t", *table, "-F"]),
                None => Action::exec(layer.program(), ["-F"]),
            },
            Intent::FrameSnat {
                source,
                out_iface,
                to,
            } => Action::exec(
                "ebtables",
                [
                    "-t".to_string(),
                    "nat".into(),
                    "-A".into(),
                    "POSTROUTING".into(),
                    "-s".into(),
                    source.to_string(),
                    "-o".into(),
                    out_iface.clone(),
                    "-j".into(),
                    "snat".into(),
                    "--snat-arp".into(),
                    "--to-src".into(),
                    to.to_string(),
                ],
            ),
            Intent::Snat {
                out_iface,
                source,
                destination,
                protocol,
                to,
                ports,
            } => {
                let mut args: Vec<String> = vec![
                    "-t".into(),
                    "nat".into(),
                    "-A".into(),
                    "POSTROUTING".into(),
                    "-o".into(),
                    out_iface.clone(),
                    "-s".into(),
                    source.to_string(),
                ];
                if let Some(dst) = destination {
                    args.push("-d".into());
                    args.push(dst.to_string());
                }
                args.extend([
                    "-p".to_string(),
                    protocol.as_str().into(),
                    "-j".into(),
                    "SNAT".into(),
                    "--to".into(),
                ]);
                if protocol.has_ports() {
                    args.push(format!("{}:{}", to, ports));
                } else {
                    args.push(to.to_string());
                }
                Action::exec("iptables", args)
            }
            Intent::SetTtl { out_iface, ttl } => Action::exec(
                "iptables",
                [
                    "-t".to_string(),
                    "mangle".into(),
                    "-A".into(),
                    "POSTROUTING".into(),
                    "-o".into(),
                    out_iface.clone(),
                    "-j".into(),
                    "TTL".into(),
                    "--ttl-set".into(),
                    ttl.to_string(),
                ],
            ),
            Intent::AddNeighbor { ip, mac, dev } => neigh("add", *ip, *mac, dev),
            Intent::ReplaceNeighbor { ip, mac, dev } => neigh("replace", *ip, *mac, dev),
            Intent::AddRoute { dest, via, dev } => route("add", dest, *via, dev),
            Intent::ReplaceRoute { dest, via, dev } => route("replace", dest, *via, dev),
            Intent::DeleteRoute { selector } => {
                let mut args = vec!["route".to_string(), "del".into()];
                args.extend(selector.iter().cloned());
                Action::exec("ip", args)
            }
            Intent::Sysctl { key, value } => {
                Action::exec("sysctl", ["-w".to_string(), format!("{}={}", key, value)])
            }
            Intent::WriteFile { path, contents } => Action::write_file(path, contents.clone()),
            Intent::SetManaged { iface, managed } => Action::exec(
                "nmcli",
                [
                    "d",
                    "set",
                    iface.as_str(),
                    "managed",
                    if *managed { "yes" } else { "no" },
                ],
            ),
        }
    }
}

fn neigh(verb: &str, ip: Ipv4Addr, mac: MacAddr, dev: &str) -> Action {
    Action::exec(
        "ip",
        [
            "neigh".to_string(),
            verb.into(),
            ip.to_string(),
            "lladdr".into(),
            mac.to_string(),
            "dev".into(),
            dev.into(),
        ],
    )
}

fn route(verb: &str, dest: &RouteDest, via: Option<Ipv4Addr>, dev: &str) -> Action {
    let mut args = vec!["route".to_string(), verb.into(), dest.to_string()];
    if let Some(gw) = via {
        args.push("via".into());
        args.push(gw.to_string());
    }
    args.push("dev".into());
    args.push(dev.into());
    Action::exec("ip", args)
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_action())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(intent: Intent) -> String {
        intent.to_string()
    }

    #[test]
    fn test_policy_and_allow() {
        assert_eq!(
            line(Intent::SetOutputPolicy {
                layer: Layer::Arp,
                verdict: Verdict::Drop
            }),
            "arptables -P OUTPUT DROP"
        );
        assert_eq!(
            line(Intent::AllowOutput {
                layer: Layer::Frame,
                iface: "wan".into()
            }),
            "ebtables -A OUTPUT -o wan -j ACCEPT"
        );
        assert_eq!(
            line(Intent::AllowOutputFrom {
                iface: "dolos_bridge".into(),
                source: Ipv4Addr::new(169, 254, 66, 77)
            }),
            "iptables -A OUTPUT -o dolos_bridge -s 169.254.66.77 -j ACCEPT"
        );
    }

    #[test]
    fn test_frame_drop_and_flush() {
        assert_eq!(
            line(Intent::DropFrameType {
                ethertype: EtherType::AppleTalkArp
            }),
            "ebtables -A OUTPUT -p 0x80F3 -j DROP"
        );
        assert_eq!(
            line(Intent::Flush {
                layer: Layer::Ip,
                table: Some("mangle")
            }),
            "iptables -t mangle -F"
        );
        assert_eq!(
            line(Intent::Flush {
                layer: Layer::Arp,
                table: None
            }),
            "arptables -F"
        );
    }

    #[test]
    fn test_snat_rendering() {
        let ports = PortRange::default();
        let tcp = Intent::Snat {
            out_iface: "dolos_bridge".into(),
            source: "172.16.100.0/24".parse().unwrap(),
            destination: None,
            protocol: Protocol::Tcp,
            to: Ipv4Addr::new(10, 0, 0, 23),
            ports,
        };
        assert_eq!(
            line(tcp),
            "iptables -t nat -A POSTROUTING -o dolos_bridge -s 172.16.100.0/24 -p tcp -j SNAT --to 10.0.0.23:61000-62000"
        );

        let icmp = Intent::Snat {
            out_iface: "dolos_bridge".into(),
            source: "169.254.0.0/16".parse().unwrap(),
            destination: Some(Ipv4Addr::new(10, 0, 0, 23)),
            protocol: Protocol::Icmp,
            to: Ipv4Addr::new(10, 0, 0, 1),
            ports,
        };
        assert_eq!(
            line(icmp),
            "iptables -t nat -A POSTROUTING -o dolos_bridge -s 169.254.0.0/16 -d 10.0.0.23 -p icmp -j SNAT --to 10.0.0.1"
        );
    }

    #[test]
    fn test_frame_snat_rendering() {
        let intent = Intent::FrameSnat {
            source: "00:01:01:01:01:01".parse().unwrap(),
            out_iface: "lan0".into(),
            to: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        };
        assert_eq!(
            line(intent),
            "ebtables -t nat -A POSTROUTING -s 00:01:01:01:01:01 -o lan0 -j snat --snat-arp --to-src aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn test_ip_commands() {
        assert_eq!(
            line(Intent::AddNeighbor {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
                dev: "dolos_bridge".into()
            }),
            "ip neigh add 10.0.0.5 lladdr aa:bb:cc:dd:ee:ff dev dolos_bridge"
        );
        assert_eq!(
            line(Intent::AddRoute {
                dest: RouteDest::Prefix(Ipv4Cidr::host(Ipv4Addr::new(10, 0, 0, 5))),
                via: None,
                dev: "dolos_bridge".into()
            }),
            "ip route add 10.0.0.5/32 dev dolos_bridge"
        );
        assert_eq!(
            line(Intent::AddRoute {
                dest: RouteDest::Default,
                via: Some(Ipv4Addr::new(169, 254, 66, 55)),
                dev: "dolos_bridge".into()
            }),
            "ip route add default via 169.254.66.55 dev dolos_bridge"
        );
        assert_eq!(
            line(Intent::DeleteRoute {
                selector: vec!["default".into()]
            }),
            "ip route del default"
        );
    }

    #[test]
    fn test_replace_commands() {
        assert_eq!(
            line(Intent::ReplaceNeighbor {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                mac: "aa:bb:cc:dd:ee:01".parse().unwrap(),
                dev: "dolos_bridge".into()
            }),
            "ip neigh replace 10.0.0.5 lladdr aa:bb:cc:dd:ee:01 dev dolos_bridge"
        );
        assert_eq!(
            line(Intent::ReplaceRoute {
                dest: RouteDest::Prefix(Ipv4Cidr::host(Ipv4Addr::new(10, 0, 0, 5))),
                via: None,
                dev: "dolos_bridge".into()
            }),
            "ip route replace 10.0.0.5/32 dev dolos_bridge"
        );
    }

    #[test]
    fn test_misc_commands() {
        assert_eq!(
            line(Intent::SetTtl {
                out_iface: "dolos_bridge".into(),
                ttl: 128
            }),
            "iptables -t mangle -A POSTROUTING -o dolos_bridge -j TTL --ttl-set 128"
        );
        assert_eq!(
            line(Intent::Sysctl {
                key: "net.ipv6.conf.lan0.accept_ra".into(),
                value: "0".into()
            }),
            "sysctl -w net.ipv6.conf.lan0.accept_ra=0"
        );
        assert_eq!(
            line(Intent::SetManaged {
                iface: "lan1".into(),
                managed: false
            }),
            "nmcli d set lan1 managed no"
        );
        assert_eq!(
            line(Intent::LoadModule {
                name: "br_netfilter".into()
            }),
            "modprobe br_netfilter"
        );
    }
}
