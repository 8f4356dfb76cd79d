use super::{Action, AuditLog, CommandRunner, Fallback, Invocation, DEFAULT_TIMEOUT};
use crate::rules::{Intent, Outcome, RuleLedger};
use crate::telemetry::Metrics;
use crate::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Audited, deadline-bounded front end to a [`CommandRunner`].
///
/// Kernel-state changes go through [`apply`](Self::apply) so they land in
/// the [`RuleLedger`]; queries and helper tools go through
/// [`execute`](Self::execute).
pub struct Executor<R> {
    runner: R,
    audit: tokio::sync::Mutex<AuditLog>,
    ledger: Mutex<RuleLedger>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl<R: CommandRunner> Executor<R> {
    pub fn new(runner: R, audit: AuditLog, metrics: Arc<Metrics>) -> Self {
        Self {
            runner,
            audit: tokio::sync::Mutex::new(audit),
            ledger: Mutex::new(RuleLedger::new()),
            metrics,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run an invocation, returning captured stdout.
    ///
    /// On failure the error propagates unless the invocation is marked
    /// [`Fallback::NoOp`], in which case empty output is returned.
    pub async fn execute(&self, invocation: &Invocation) -> Result<String> {
        let result = self.run_audited(invocation).await;
        self.settle(invocation, result)
    }

    /// Execute an action that must succeed.
    pub async fn run(&self, description: &str, action: Action) -> Result<String> {
        self.execute(&Invocation::new(description, action)).await
    }

    /// Apply a kernel-state change whose failure propagates.
    pub async fn apply(&self, description: &str, intent: Intent) -> Result<()> {
        self.apply_with(Invocation::new(description, intent.to_action()), intent)
            .await
    }

    /// Apply a kernel-state change whose failure is logged and absorbed.
    pub async fn apply_or_noop(&self, description: &str, intent: Intent) {
        let invocation = Invocation::new(description, intent.to_action()).or_noop();
        // A NoOp invocation settles to Ok.
        let _ = self.apply_with(invocation, intent).await;
    }

    async fn apply_with(&self, invocation: Invocation, intent: Intent) -> Result<()> {
        let result = self.run_audited(&invocation).await;
        let outcome = match (&result, invocation.fallback) {
            (Ok(_), _) => Outcome::Applied,
            (Err(e), Fallback::NoOp) => Outcome::Absorbed(e.to_string()),
            (Err(e), Fallback::Propagate) => Outcome::Failed(e.to_string()),
        };
        self.ledger().record(intent, outcome);
        self.settle(&invocation, result).map(|_| ())
    }

    async fn run_audited(&self, invocation: &Invocation) -> Result<String> {
        let command = invocation.action.to_string();
        self.metrics.commands_run.inc();
        debug!(description = %invocation.description, command = %command, "executing");

        let mut audit = self.audit.lock().await;
        if let Err(e) = audit.command(&invocation.description, &command).await {
            warn!(error = %e, "audit write failed");
        }

        let result = self.runner.run(&invocation.action, self.timeout).await;

        let written = match &result {
            Ok(output) => audit.output(output).await,
            Err(err) => {
                if err.is_timeout() {
                    self.metrics.commands_timed_out.inc();
                }
                audit.failure(err).await
            }
        };
        if let Err(e) = written {
            warn!(error = %e, "audit write failed");
        }
        result
    }

    fn settle(&self, invocation: &Invocation, result: Result<String>) -> Result<String> {
        match (result, invocation.fallback) {
            (Ok(output), _) => Ok(output),
            (Err(err), Fallback::NoOp) => {
                self.metrics.commands_absorbed.inc();
                warn!(
                    description = %invocation.description,
                    error = %err,
                    "command failed, continuing"
                );
                Ok(String::new())
            }
            (Err(err), Fallback::Propagate) => {
                self.metrics.commands_failed.inc();
                Err(err)
            }
        }
    }

    /// Write a free-form note to the audit streams.
    pub async fn note(&self, description: &str) {
        if let Err(e) = self.audit.lock().await.info(description).await {
            warn!(error = %e, "audit write failed");
        }
    }

    pub async fn flush_audit(&self) -> Result<()> {
        self.audit.lock().await.flush().await
    }

    /// Read access to the applied-intent ledger.
    pub fn with_ledger<T>(&self, f: impl FnOnce(&RuleLedger) -> T) -> T {
        f(&self.ledger())
    }

    fn ledger(&self) -> MutexGuard<'_, RuleLedger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::DryRunRunner;
    use crate::rules::{Layer, Verdict};
    use crate::Error;

    fn executor(runner: DryRunRunner) -> Executor<DryRunRunner> {
        Executor::new(runner, AuditLog::disabled(), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_execute_success() {
        let exec = executor(DryRunRunner::new().with_output("brctl showmacs", "port no\n"));
        let out = exec
            .run("list macs", Action::exec("brctl", ["showmacs", "br0"]))
            .await
            .unwrap();
        assert_eq!(out, "port no\n");
        assert_eq!(exec.metrics.commands_run.get(), 1);
        assert_eq!(exec.metrics.commands_failed.get(), 0);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let exec = executor(DryRunRunner::new().fail_on("iptables"));
        let err = exec
            .apply(
                "drop output",
                Intent::SetOutputPolicy {
                    layer: Layer::Ip,
                    verdict: Verdict::Drop,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(exec.metrics.commands_failed.get(), 1);
        exec.with_ledger(|l| {
            assert_eq!(l.len(), 1);
            assert!(matches!(l.entries()[0].outcome, Outcome::Failed(_)));
            assert_eq!(l.effective_policy(Layer::Ip), Verdict::Accept);
        });
    }

    #[tokio::test]
    async fn test_noop_absorbs_failure() {
        let exec = executor(DryRunRunner::new().fail_on("modprobe"));
        exec.apply_or_noop(
            "load module",
            Intent::LoadModule {
                name: "br_netfilter".into(),
            },
        )
        .await;
        assert_eq!(exec.metrics.commands_absorbed.get(), 1);
        assert_eq!(exec.metrics.commands_failed.get(), 0);
        exec.with_ledger(|l| {
            assert!(matches!(l.entries()[0].outcome, Outcome::Absorbed(_)));
        });
    }

    #[tokio::test]
    async fn test_timeout_counted() {
        let exec = executor(DryRunRunner::new().timeout_on("brctl"));
        let err = exec
            .run("list macs", Action::exec("brctl", ["showmacs", "br0"]))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(exec.metrics.commands_timed_out.get(), 1);
        assert_eq!(exec.metrics.commands_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_audit_records_command_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("current.log");
        let audit = AuditLog::open(&session, dir.path().join("history.log"))
            .await
            .unwrap();
        let exec = Executor::new(
            DryRunRunner::new().fail_on("nmcli"),
            audit,
            Arc::new(Metrics::new()),
        );

        exec.apply_or_noop(
            "release lan0",
            Intent::SetManaged {
                iface: "lan0".into(),
                managed: false,
            },
        )
        .await;
        exec.flush_audit().await.unwrap();

        let text = std::fs::read_to_string(&session).unwrap();
        assert!(text.contains("INFO: release lan0"));
        assert!(text.contains("COMMAND: nmcli d set lan0 managed no"));
        assert!(text.contains("FAILED: "));
    }
}
