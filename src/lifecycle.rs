//! Bring-up and teardown of the baseline filtering policy.
//!
//! ```text
//! Uninitialized ──start──▶ BaselineApplied ──flush──▶ Flushed ──exit──▶ Exited
//!       └──────────────────────flush───────────────────────▲
//! ```
//!
//! Only this module resets policies or flushes tables. A flush straight from
//! `Uninitialized` is allowed so a crashed run can be cleaned up.

use crate::bridge::list_interfaces;
use crate::config::Settings;
use crate::exec::{Action, CommandRunner, Executor};
use crate::net::EtherType;
use crate::rules::{Intent, Layer, Verdict};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

const KERNEL_MODULES: [&str; 2] = ["arptable_filter", "br_netfilter"];

/// Forward EAPOL (group address 01:80:C2:00:00:03) across the bridge.
const EAPOL_FWD_MASK: &str = "8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    BaselineApplied,
    Flushed,
    Exited,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::BaselineApplied => "baseline_applied",
            LifecycleState::Flushed => "flushed",
            LifecycleState::Exited => "exited",
        }
    }
}

pub struct LifecycleManager {
    settings: Arc<Settings>,
    state: LifecycleState,
}

impl LifecycleManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, allowed: &[LifecycleState], to: LifecycleState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }

    /// Interfaces outside the bridge that must keep working.
    fn bystander_interfaces(&self) -> Result<Vec<String>> {
        Ok(list_interfaces(&self.settings.sysfs_root)?
            .into_iter()
            .filter(|iface| !self.settings.is_mitm_interface(iface))
            .collect())
    }

    /// Apply the default-deny baseline.
    pub async fn start<R: CommandRunner>(&mut self, exec: &Executor<R>) -> Result<()> {
        self.transition(&[LifecycleState::Uninitialized], LifecycleState::BaselineApplied)?;
        let s = Arc::clone(&self.settings);

        // Enumerate first so a missing sysfs aborts before anything is dropped.
        let bystanders = self.bystander_interfaces()?;
        exec.note(&format!("MitM bridge {} starting", s.bridge)).await;

        for module in KERNEL_MODULES {
            exec.apply_or_noop(
                &format!("Load {} kernel module", module),
                Intent::LoadModule {
                    name: module.to_string(),
                },
            )
            .await;
        }

        exec.apply(
            "Allow loopback traffic",
            Intent::AllowOutput {
                layer: Layer::Ip,
                iface: "lo".to_string(),
            },
        )
        .await?;

        for layer in [Layer::Ip, Layer::Frame, Layer::Arp] {
            exec.apply(
                &format!("Drop all outbound {} traffic by default", layer),
                Intent::SetOutputPolicy {
                    layer,
                    verdict: Verdict::Drop,
                },
            )
            .await?;
        }

        for iface in &bystanders {
            for layer in Layer::ALL {
                exec.apply(
                    &format!("Allow OUTPUT on non-MitM interface: {}", iface),
                    Intent::AllowOutput {
                        layer,
                        iface: iface.clone(),
                    },
                )
                .await?;
            }
        }

        for ethertype in EtherType::IDENTITY_LEAKING {
            exec.apply(
                "Block identity-leaking ARP frame types on OUTPUT",
                Intent::DropFrameType { ethertype },
            )
            .await?;
        }

        if s.externally_managed {
            for member in s.members() {
                exec.apply_or_noop(
                    &format!("Stop NetworkManager from managing {}", member),
                    Intent::SetManaged {
                        iface: member.to_string(),
                        managed: false,
                    },
                )
                .await;
            }
        }

        for iface in [s.bridge.as_str(), s.switch_interface.as_str(), s.supplicant_interface.as_str()] {
            for (knob, what) in [("autoconf", "Disable IPv6 autoconf"), ("accept_ra", "Ignore IPv6 router advertisements")] {
                exec.apply_or_noop(
                    &format!("{} on {}", what, iface),
                    Intent::Sysctl {
                        key: format!("net.ipv6.conf.{}.{}", iface, knob),
                        value: "0".to_string(),
                    },
                )
                .await;
            }
        }

        if s.replace_default_route {
            self.remove_default_route(exec).await;
        }

        let mask_path = s
            .sysfs_root
            .join("class/net")
            .join(&s.bridge)
            .join("bridge/group_fwd_mask");
        if let Err(e) = exec
            .apply(
                &format!("Allow EAPOL on {}", s.bridge),
                Intent::WriteFile {
                    path: mask_path,
                    contents: EAPOL_FWD_MASK.to_string(),
                },
            )
            .await
        {
            error!(bridge = %s.bridge, error = %e, "failed to set group_fwd_mask, 802.1x will not pass");
        }

        self.state = LifecycleState::BaselineApplied;
        info!(bridge = %s.bridge, bystanders = bystanders.len(), "baseline applied");
        Ok(())
    }

    async fn remove_default_route<R: CommandRunner>(&self, exec: &Executor<R>) {
        let routes = match exec
            .run(
                "Get default route in case we need to delete it",
                Action::exec("ip", ["route", "show", "default"]),
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "cannot read default route");
                return;
            }
        };
        if let Some(first) = routes.lines().map(str::trim).find(|l| !l.is_empty()) {
            exec.apply_or_noop(
                "Delete default route",
                Intent::DeleteRoute {
                    selector: first.split_whitespace().map(String::from).collect(),
                },
            )
            .await;
        }
    }

    /// Flush every table and restore default-accept. Each step is
    /// best-effort.
    pub async fn flush<R: CommandRunner>(&mut self, exec: &Executor<R>) -> Result<()> {
        self.transition(
            &[
                LifecycleState::Uninitialized,
                LifecycleState::BaselineApplied,
                LifecycleState::Flushed,
            ],
            LifecycleState::Flushed,
        )?;

        for layer in Layer::ALL {
            for table in layer.tables() {
                exec.apply_or_noop(
                    &format!("Flush {} rules", layer),
                    Intent::Flush {
                        layer,
                        table: *table,
                    },
                )
                .await;
            }
        }

        for layer in [Layer::Ip, Layer::Frame, Layer::Arp] {
            exec.apply_or_noop(
                &format!("Reset {} OUTPUT policy to ACCEPT", layer),
                Intent::SetOutputPolicy {
                    layer,
                    verdict: Verdict::Accept,
                },
            )
            .await;
        }

        match self.bystander_interfaces() {
            Ok(bystanders) => {
                for iface in bystanders {
                    for layer in Layer::ALL {
                        exec.apply_or_noop(
                            &format!("Ensure OUTPUT allowed on non-MitM interface: {}", iface),
                            Intent::AllowOutput {
                                layer,
                                iface: iface.clone(),
                            },
                        )
                        .await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot enumerate interfaces during teardown"),
        }

        self.state = LifecycleState::Flushed;
        info!("rules flushed");
        Ok(())
    }

    /// Hand the members back and enter the terminal state.
    pub async fn exit<R: CommandRunner>(&mut self, exec: &Executor<R>) -> Result<()> {
        self.transition(&[LifecycleState::Flushed], LifecycleState::Exited)?;

        if self.settings.externally_managed {
            for member in self.settings.members() {
                exec.apply_or_noop(
                    &format!("Return {} to NetworkManager", member),
                    Intent::SetManaged {
                        iface: member.to_string(),
                        managed: true,
                    },
                )
                .await;
            }
        }

        exec.note("MitM bridge exiting").await;
        if let Err(e) = exec.flush_audit().await {
            warn!(error = %e, "audit flush failed");
        }
        self.state = LifecycleState::Exited;
        info!("exited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Settings};
    use crate::exec::{AuditLog, DryRunRunner};
    use crate::telemetry::Metrics;
    use std::fs;

    struct Fixture {
        _sysfs: tempfile::TempDir,
        settings: Arc<Settings>,
    }

    fn fixture(extra: &str) -> Fixture {
        let sysfs = tempfile::tempdir().unwrap();
        for iface in ["lo", "wan", "lan0", "lan1", "dolos_bridge"] {
            fs::create_dir_all(sysfs.path().join("class/net").join(iface)).unwrap();
        }
        fs::create_dir_all(sysfs.path().join("class/net/dolos_bridge/bridge")).unwrap();

        let text = format!(
            "[bridge]\nswitch_interface = \"lan0\"\nsupplicant_interface = \"lan1\"\n\
             [attacker]\nsubnet = \"172.16.100.0/24\"\n\
             [system]\nsysfs_root = {:?}\n{}",
            sysfs.path().display().to_string(),
            extra
        );
        let config: Config = toml::from_str(&text).unwrap();
        Fixture {
            settings: Arc::new(Settings::from_config(&config).unwrap()),
            _sysfs: sysfs,
        }
    }

    fn executor(runner: DryRunRunner) -> Executor<DryRunRunner> {
        Executor::new(runner, AuditLog::disabled(), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_start_order_and_allows() {
        let fx = fixture("");
        let runner = DryRunRunner::new();
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.start(&exec).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::BaselineApplied);

        let lines = runner.command_lines();
        assert_eq!(lines[0], "modprobe arptable_filter");
        assert_eq!(lines[1], "modprobe br_netfilter");
        assert_eq!(lines[2], "iptables -A OUTPUT -o lo -j ACCEPT");
        assert_eq!(lines[3], "iptables -P OUTPUT DROP");
        assert_eq!(lines[4], "ebtables -P OUTPUT DROP");
        assert_eq!(lines[5], "arptables -P OUTPUT DROP");

        for prog in ["ebtables", "iptables", "arptables"] {
            assert!(lines.contains(&format!("{} -A OUTPUT -o wan -j ACCEPT", prog)));
            for member in ["lan0", "lan1", "dolos_bridge"] {
                assert!(!lines.contains(&format!("{} -A OUTPUT -o {} -j ACCEPT", prog, member)));
            }
        }
        for proto in ["0x0806", "0x0808", "0x8035", "0x80F3"] {
            assert!(lines.contains(&format!("ebtables -A OUTPUT -p {} -j DROP", proto)));
        }
        assert_eq!(runner.count("sysctl -w net.ipv6.conf."), 6);
        assert_eq!(runner.count("nmcli"), 0);
        assert_eq!(runner.count("ip route"), 0);
        assert!(lines.last().unwrap().starts_with("write "));
        assert!(lines.last().unwrap().ends_with("dolos_bridge/bridge/group_fwd_mask \"8\""));

        exec.with_ledger(|ledger| {
            for layer in Layer::ALL {
                assert_eq!(ledger.effective_policy(layer), Verdict::Drop);
                assert!(ledger.permits_output(layer, "wan"));
                assert!(!ledger.permits_output(layer, "lan0"));
            }
        });
    }

    #[tokio::test]
    async fn test_start_replaces_default_route() {
        let fx = fixture("[routing]\nreplace_default_route = true\n[interfaces]\nexternally_managed = true\n");
        let runner = DryRunRunner::new().with_output(
            "ip route show default",
            "default via 192.168.1.1 dev wan proto dhcp metric 100\n",
        );
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.start(&exec).await.unwrap();
        let lines = runner.command_lines();
        assert!(lines.contains(&"ip route del default via 192.168.1.1 dev wan proto dhcp metric 100".to_string()));
        assert!(lines.contains(&"nmcli d set lan0 managed no".to_string()));
        assert!(lines.contains(&"nmcli d set lan1 managed no".to_string()));
    }

    #[tokio::test]
    async fn test_tolerated_failures_do_not_abort() {
        let fx = fixture("");
        let runner = DryRunRunner::new()
            .fail_on("modprobe")
            .fail_on("sysctl")
            .fail_on("write ");
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.start(&exec).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::BaselineApplied);
    }

    #[tokio::test]
    async fn test_required_failure_aborts() {
        let fx = fixture("");
        let exec = executor(DryRunRunner::new().fail_on("ebtables -P"));
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        assert!(lifecycle.start(&exec).await.is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_flush_restores_accept() {
        let fx = fixture("");
        let runner = DryRunRunner::new();
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.start(&exec).await.unwrap();
        runner.clear();
        lifecycle.flush(&exec).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(
            &lines[..7],
            &[
                "ebtables -t filter -F",
                "ebtables -t nat -F",
                "iptables -t filter -F",
                "iptables -t nat -F",
                "iptables -t mangle -F",
                "iptables -t raw -F",
                "arptables -F",
            ]
        );
        exec.with_ledger(|ledger| {
            for layer in Layer::ALL {
                assert_eq!(ledger.effective_policy(layer), Verdict::Accept);
                assert!(ledger.permits_output(layer, "lan0"));
            }
        });
    }

    #[tokio::test]
    async fn test_flush_is_best_effort() {
        let fx = fixture("");
        let runner = DryRunRunner::new().fail_on("ebtables").fail_on("iptables -t");
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.flush(&exec).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Flushed);
        assert_eq!(runner.count("arptables -P OUTPUT ACCEPT"), 1);
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let fx = fixture("");
        let exec = executor(DryRunRunner::new());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        let err = lifecycle.exit(&exec).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: "uninitialized",
                to: "exited"
            }
        ));

        lifecycle.start(&exec).await.unwrap();
        assert!(lifecycle.start(&exec).await.is_err());

        lifecycle.flush(&exec).await.unwrap();
        lifecycle.exit(&exec).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Exited);
        assert!(lifecycle.flush(&exec).await.is_err());
        assert!(lifecycle.exit(&exec).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_returns_members() {
        let fx = fixture("[interfaces]\nexternally_managed = true\n");
        let runner = DryRunRunner::new();
        let exec = executor(runner.clone());
        let mut lifecycle = LifecycleManager::new(fx.settings.clone());

        lifecycle.flush(&exec).await.unwrap();
        lifecycle.exit(&exec).await.unwrap();
        assert_eq!(runner.count("nmcli d set lan0 managed yes"), 1);
        assert_eq!(runner.count("nmcli d set lan1 managed yes"), 1);
    }
}
