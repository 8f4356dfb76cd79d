//! Audit trail of every executed command.
//!
//! Two plain-text streams receive identical lines: the session log is
//! truncated when opened, the history log is appended to across runs.

use crate::{Error, Result};
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
pub struct AuditLog {
    session: Option<File>,
    history: Option<File>,
}

impl AuditLog {
    /// Open both streams, creating parent directories as needed.
    pub async fn open(session: impl AsRef<Path>, history: impl AsRef<Path>) -> Result<Self> {
        let session = open_stream(session.as_ref(), true).await?;
        let history = open_stream(history.as_ref(), false).await?;

        let mut log = Self {
            session: Some(session),
            history: Some(history),
        };
        let header = format!(
            "===== session started {} =====",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z")
        );
        log.write_line(&header).await?;
        Ok(log)
    }

    /// An audit log that writes nowhere.
    pub fn disabled() -> Self {
        Self {
            session: None,
            history: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some() || self.history.is_some()
    }

    /// Record a free-form note.
    pub async fn info(&mut self, description: &str) -> Result<()> {
        self.write_line(&format!("INFO: {}", description)).await
    }

    /// Record an invocation before it runs.
    pub async fn command(&mut self, description: &str, command: &str) -> Result<()> {
        self.info(description).await?;
        self.write_line(&format!("COMMAND: {}", command)).await
    }

    /// Record captured output. Empty output is not written.
    pub async fn output(&mut self, output: &str) -> Result<()> {
        let output = output.trim_end();
        if output.is_empty() {
            return Ok(());
        }
        self.write_line(&format!("OUTPUT: {}", output)).await
    }

    pub async fn failure(&mut self, error: &Error) -> Result<()> {
        self.write_line(&format!("FAILED: {}", error)).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        for file in [&mut self.session, &mut self.history].into_iter().flatten() {
            file.flush()
                .await
                .map_err(|e| Error::Audit(format!("flush failed: {}", e)))?;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        for file in [&mut self.session, &mut self.history].into_iter().flatten() {
            file.write_all(&bytes)
                .await
                .map_err(|e| Error::Audit(format!("write failed: {}", e)))?;
        }
        Ok(())
    }
}

async fn open_stream(path: &Path, truncate: bool) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Audit(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| Error::Audit(format!("cannot open {}: {}", path.display(), e)))
}
