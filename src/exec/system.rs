//! Runner that touches the real system.

use super::{Action, CommandRunner};
use crate::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

/// Spawns processes with `tokio::process` and writes files with `tokio::fs`.
///
/// A process that outlives its deadline is killed when its handle drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, action: &Action, timeout: Duration) -> Result<String> {
        match action {
            Action::Exec { program, args } => {
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;

                let output = tokio::time::timeout(timeout, child.wait_with_output())
                    .await
                    .map_err(|_| Error::CommandTimedOut {
                        program: program.clone(),
                        timeout,
                    })??;

                trace!(program = %program, status = %output.status, "process exited");

                if !output.status.success() {
                    return Err(Error::CommandFailed {
                        program: program.clone(),
                        status: output.status.to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Action::WriteFile { path, contents } => {
                tokio::time::timeout(timeout, tokio::fs::write(path, contents))
                    .await
                    .map_err(|_| Error::CommandTimedOut {
                        program: action.program().to_string(),
                        timeout,
                    })??;
                Ok(String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = SystemRunner
            .run(&Action::exec("echo", ["hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let err = SystemRunner
            .run(&Action::exec("false", Vec::<String>::new()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn test_deadline_is_failure() {
        let err = SystemRunner
            .run(&Action::exec("sleep", ["5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let err = SystemRunner
            .run(
                &Action::exec("/nonexistent/dolos-tool", Vec::<String>::new()),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group_fwd_mask");
        SystemRunner
            .run(&Action::write_file(&path, "8"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "8");
    }
}
