//! The orchestrator loop
//!
//! Owns the executor, the lifecycle manager and the spoofing engine, and
//! handles discovery events and control requests one at a time.

use crate::bridge::InterfaceIdentityCache;
use crate::config::Settings;
use crate::control::{ControlHandle, ControlRequest, InterfaceOutput, OutputPolicy, Snapshot};
use crate::engine::{BridgeUpdate, DiscoveryEvent, Handled, SpoofingEngine};
use crate::exec::{AuditLog, CommandRunner, Executor};
use crate::lifecycle::LifecycleManager;
use crate::telemetry::Metrics;
use crate::Result;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 64;
const CONTROL_QUEUE: usize = 8;
const UPDATE_QUEUE: usize = 64;

/// Endpoints for talking to a running orchestrator.
#[derive(Debug, Clone)]
pub struct Handles {
    pub events: mpsc::Sender<DiscoveryEvent>,
    pub control: ControlHandle,
    pub updates: broadcast::Sender<BridgeUpdate>,
    pub metrics: Arc<Metrics>,
}

pub struct Orchestrator<R> {
    settings: Arc<Settings>,
    exec: Executor<R>,
    lifecycle: LifecycleManager,
    engine: SpoofingEngine,
    metrics: Arc<Metrics>,
    events: mpsc::Receiver<DiscoveryEvent>,
    control: mpsc::Receiver<ControlRequest>,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(settings: Arc<Settings>, runner: R, audit: AuditLog) -> (Self, Handles) {
        let metrics = Arc::new(Metrics::new());
        let exec = Executor::new(runner, audit, Arc::clone(&metrics))
            .with_timeout(settings.command_timeout);
        let identities = InterfaceIdentityCache::load(&settings.sysfs_root, &settings.members());

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (update_tx, _) = broadcast::channel(UPDATE_QUEUE);

        let orchestrator = Self {
            settings: Arc::clone(&settings),
            exec,
            lifecycle: LifecycleManager::new(Arc::clone(&settings)),
            engine: SpoofingEngine::new(settings, identities, update_tx.clone()),
            metrics: Arc::clone(&metrics),
            events: event_rx,
            control: control_rx,
        };
        let handles = Handles {
            events: event_tx,
            control: ControlHandle::new(control_tx),
            updates: update_tx,
            metrics,
        };
        (orchestrator, handles)
    }

    pub fn snapshot(&self) -> Snapshot {
        let s = &self.settings;
        let mitm = [s.bridge.as_str(), s.switch_interface.as_str(), s.supplicant_interface.as_str()];
        let (output_policy, mitm_output, ledger_entries) = self.exec.with_ledger(|ledger| {
            let per_iface: BTreeMap<_, _> = mitm
                .iter()
                .map(|iface| (iface.to_string(), InterfaceOutput::from_ledger(ledger, iface)))
                .collect();
            (OutputPolicy::from_ledger(ledger), per_iface, ledger.len())
        });
        Snapshot {
            lifecycle: self.lifecycle.state(),
            topology: self.engine.topology().clone(),
            neighbors: self.engine.neighbors().entries(),
            output_policy,
            mitm_output,
            ledger_entries,
            deferred_client_rules: self.engine.has_deferred_rules(),
            counters: self.metrics.export().into_iter().collect(),
        }
    }

    /// Apply the baseline, serve events and requests until `shutdown`
    /// resolves or a shutdown request arrives, then tear down.
    ///
    /// Returns the snapshot taken after teardown.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<Snapshot> {
        if let Err(e) = self.lifecycle.start(&self.exec).await {
            error!(error = %e, "baseline failed, tearing down");
            self.teardown().await;
            return Err(e);
        }
        info!("orchestrator running");

        tokio::pin!(shutdown);
        let mut events_open = true;
        let mut control_open = true;
        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

        // Closed channels only disable their branch; the session lasts until
        // shutdown is requested.
        loop {
            tokio::select! {
                // Queued events drain before control requests.
                biased;
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("event feed closed, waiting for shutdown");
                        events_open = false;
                    }
                },
                request = self.control.recv(), if control_open => match request {
                    Some(ControlRequest::Shutdown { reply }) => {
                        info!("shutdown requested");
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(request) => self.handle_control(request).await,
                    None => {
                        debug!("control channel closed");
                        control_open = false;
                    }
                },
            }
        }

        self.teardown().await;
        let snapshot = self.snapshot();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        Ok(snapshot)
    }

    async fn handle_event(&mut self, event: DiscoveryEvent) {
        let name = event.name();
        match self.engine.handle(&self.exec, event).await {
            Ok(Handled::Applied) => self.metrics.events_handled.inc(),
            Ok(Handled::Ignored) => self.metrics.events_ignored.inc(),
            Err(e) => {
                self.metrics.events_handled.inc();
                error!(event = name, error = %e, "reaction failed");
            }
        }
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::EnableDefaultRoute { reply } => {
                let result = self.engine.enable_default_route(&self.exec).await;
                if let Err(e) = &result {
                    error!(error = %e, "enabling default route failed");
                }
                let _ = reply.send(result);
            }
            ControlRequest::SendDiscoveryProbe { reply } => {
                let result = self.engine.send_discovery_probe(&self.exec).await;
                if let Err(e) = &result {
                    error!(error = %e, "discovery probe failed");
                }
                let _ = reply.send(result);
            }
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlRequest::Shutdown { reply } => {
                // Handled by the loop; answer anyway.
                let _ = reply.send(());
            }
        }
    }

    /// Flush all rules and exit. Failures are logged.
    pub async fn teardown(&mut self) {
        if let Err(e) = self.lifecycle.flush(&self.exec).await {
            warn!(error = %e, "flush skipped");
        }
        if let Err(e) = self.lifecycle.exit(&self.exec).await {
            warn!(error = %e, "exit skipped");
        }
    }
}
