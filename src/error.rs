use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout:?}")]
    CommandTimedOut { program: String, timeout: Duration },

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("audit log error: {0}")]
    Audit(String),

    #[error("orchestrator is not running")]
    NotRunning,
}

impl Error {
    /// True for failures caused by the external command hitting its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CommandTimedOut { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
