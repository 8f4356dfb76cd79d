//! Command execution
//!
//! Every change to kernel network state goes through an [`Executor`]: it
//! audits the invocation, hands it to a [`CommandRunner`] under a deadline and
//! decides whether a failure propagates or is absorbed.
//!
//! Invocations are structured (program plus argument vector, or a file
//! write). Nothing is ever passed through a shell.

mod audit;
mod dry_run;
mod executor;
mod system;

pub use audit::AuditLog;
pub use dry_run::DryRunRunner;
pub use executor::Executor;
pub use system::SystemRunner;

use crate::Result;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Deadline applied to every external command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a runner actually does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Spawn `program` with `args`
    Exec { program: String, args: Vec<String> },
    /// Replace the contents of `path`
    WriteFile { path: PathBuf, contents: String },
}

impl Action {
    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Action::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn write_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Action::WriteFile {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Program name used in errors and metrics.
    pub fn program(&self) -> &str {
        match self {
            Action::Exec { program, .. } => program,
            Action::WriteFile { .. } => "write",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Exec { program, args } => {
                write!(f, "{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Action::WriteFile { path, contents } => {
                write!(f, "write {} {:?}", path.display(), contents)
            }
        }
    }
}

/// What happens when an invocation fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// Surface the error to the caller
    #[default]
    Propagate,
    /// Log it and carry on with empty output
    NoOp,
}

/// A described action plus its failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub description: String,
    pub action: Action,
    pub fallback: Fallback,
}

impl Invocation {
    pub fn new(description: impl Into<String>, action: Action) -> Self {
        Self {
            description: description.into(),
            action,
            fallback: Fallback::Propagate,
        }
    }

    /// Mark the invocation as allowed to fail.
    pub fn or_noop(mut self) -> Self {
        self.fallback = Fallback::NoOp;
        self
    }
}

/// Something that can carry out an [`Action`].
///
/// Implementations return captured stdout on success. Non-zero exit, spawn
/// failure and deadline expiry are all errors.
pub trait CommandRunner: Send + Sync {
    fn run(&self, action: &Action, timeout: Duration)
        -> impl Future<Output = Result<String>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        let action = Action::exec("iptables", ["-P", "OUTPUT", "DROP"]);
        assert_eq!(action.to_string(), "iptables -P OUTPUT DROP");
        assert_eq!(action.program(), "iptables");

        let action = Action::write_file("/sys/class/net/br0/bridge/group_fwd_mask", "8");
        assert_eq!(
            action.to_string(),
            "write /sys/class/net/br0/bridge/group_fwd_mask \"8\""
        );
        assert_eq!(action.program(), "write");
    }

    #[test]
    fn test_invocation_fallback() {
        let inv = Invocation::new("load module", Action::exec("modprobe", ["br_netfilter"]));
        assert_eq!(inv.fallback, Fallback::Propagate);
        assert_eq!(inv.or_noop().fallback, Fallback::NoOp);
    }
}
