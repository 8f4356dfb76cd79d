//! Runner that records actions instead of performing them.

use super::{Action, CommandRunner};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    actions: Vec<Action>,
    outputs: Vec<(String, String)>,
    fail_on: Vec<String>,
    timeout_on: Vec<String>,
}

/// Records every action and answers with scripted output.
///
/// Scripted behaviour is keyed by command-line prefix, so `"brctl showmacs"`
/// matches `brctl showmacs dolos_bridge`. Clones share state, so a test can
/// keep a handle after giving the runner away.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    state: Arc<Mutex<State>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`, replacing any
    /// earlier script for the same prefix.
    pub fn with_output(self, prefix: &str, output: &str) -> Self {
        self.set_output(prefix, output);
        self
    }

    /// Like [`with_output`](Self::with_output), through a shared handle.
    pub fn set_output(&self, prefix: &str, output: &str) {
        let mut state = self.lock();
        state.outputs.retain(|(p, _)| p != prefix);
        state.outputs.push((prefix.to_string(), output.to_string()));
    }

    /// Fail commands starting with `prefix` with a non-zero exit.
    pub fn fail_on(self, prefix: &str) -> Self {
        self.lock().fail_on.push(prefix.to_string());
        self
    }

    /// Fail commands starting with `prefix` as if they hit the deadline.
    pub fn timeout_on(self, prefix: &str) -> Self {
        self.lock().timeout_on.push(prefix.to_string());
        self
    }

    /// Actions seen so far, in order.
    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    /// Actions seen so far, rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.lock().actions.iter().map(ToString::to_string).collect()
    }

    /// Number of recorded command lines starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.lock().actions.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CommandRunner for DryRunRunner {
    async fn run(&self, action: &Action, timeout: Duration) -> Result<String> {
        let line = action.to_string();
        let mut state = self.lock();
        state.actions.push(action.clone());

        if state.timeout_on.iter().any(|p| line.starts_with(p.as_str())) {
            return Err(Error::CommandTimedOut {
                program: action.program().to_string(),
                timeout,
            });
        }
        if state.fail_on.iter().any(|p| line.starts_with(p.as_str())) {
            return Err(Error::CommandFailed {
                program: action.program().to_string(),
                status: "exit status: 1".to_string(),
                stderr: "dry run failure".to_string(),
            });
        }

        Ok(state
            .outputs
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_records_and_scripts() {
        let runner = DryRunRunner::new().with_output("ip route show", "default via 10.0.0.1 dev eth0\n");
        let handle = runner.clone();

        let out = runner
            .run(&Action::exec("ip", ["route", "show", "default"]), T)
            .await
            .unwrap();
        assert_eq!(out, "default via 10.0.0.1 dev eth0\n");

        let out = runner
            .run(&Action::exec("iptables", ["-P", "OUTPUT", "DROP"]), T)
            .await
            .unwrap();
        assert!(out.is_empty());

        assert_eq!(
            handle.command_lines(),
            vec!["ip route show default", "iptables -P OUTPUT DROP"]
        );
        assert_eq!(handle.count("iptables"), 1);
    }

    #[tokio::test]
    async fn test_set_output_replaces_script() {
        let runner = DryRunRunner::new().with_output("brctl showmacs", "first");
        let handle = runner.clone();
        let action = Action::exec("brctl", ["showmacs", "br0"]);

        assert_eq!(runner.run(&action, T).await.unwrap(), "first");
        handle.set_output("brctl showmacs", "second");
        assert_eq!(runner.run(&action, T).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_fail_and_timeout() {
        let runner = DryRunRunner::new().fail_on("brctl").timeout_on("sleep");

        let err = runner
            .run(&Action::exec("brctl", ["showmacs", "br0"]), T)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));

        let err = runner.run(&Action::exec("sleep", ["30"]), T).await.unwrap_err();
        assert!(err.is_timeout());

        assert_eq!(runner.actions().len(), 2);
    }
}
