//! Package installer capability.
//!
//! The bootstrapper never interprets package bytes itself. Both the
//! download path and the self-update endpoint hand the body stream to a
//! [`PackageInstaller`] and report whatever it returns.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Opaque package byte stream.
pub type PackageStream = BoxStream<'static, io::Result<Bytes>>;

/// Installer failures.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The package itself is unusable (bad archive, missing manifest, …).
    #[error("Malformed package: {0}")]
    MalformedPayload(String),

    /// Anything else: IO, a failing install script, a missing installer.
    #[error("Install failed: {0}")]
    Failed(String),
}

impl InstallError {
    /// `true` when the payload was rejected rather than the install failing.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload(_))
    }
}

/// Applies an update package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Consume `package` and install it.
    async fn install(&self, package: PackageStream) -> Result<(), InstallError>;
}

/// Exit status conventionally used for "input data was incorrect" (`EX_DATAERR`).
pub const DEFAULT_MALFORMED_EXIT_CODE: i32 = 65;

/// Installer that pipes the package into an external program's stdin.
///
/// Exit status `0` means installed, `malformed_exit_code` means the
/// program rejected the payload, anything else is a failure.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    malformed_exit_code: i32,
}

impl CommandInstaller {
    /// Create an installer running `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            malformed_exit_code: DEFAULT_MALFORMED_EXIT_CODE,
        }
    }

    /// Override the exit status that signals a malformed payload.
    #[must_use]
    pub fn with_malformed_exit_code(mut self, code: i32) -> Self {
        self.malformed_exit_code = code;
        self
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, mut package: PackageStream) -> Result<(), InstallError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstallError::Failed(format!("Cannot start '{}': {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| InstallError::Failed("Installer stdin unavailable".to_string()))?;

        let mut written: u64 = 0;
        while let Some(chunk) = package.next().await {
            let chunk =
                chunk.map_err(|e| InstallError::Failed(format!("Reading package failed: {e}")))?;
            if let Err(e) = stdin.write_all(&chunk).await {
                // The installer closed stdin early; its exit status decides.
                warn!(program = %self.program, error = %e, "Installer stopped reading package");
                break;
            }
            written += chunk.len() as u64;
        }
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| InstallError::Failed(format!("Waiting for installer failed: {e}")))?;

        debug!(program = %self.program, bytes = written, status = %status, "Installer exited");
        match status.code() {
            Some(0) => Ok(()),
            Some(code) if code == self.malformed_exit_code => Err(InstallError::MalformedPayload(
                format!("'{}' rejected the package (exit {code})", self.program),
            )),
            _ => Err(InstallError::Failed(format!(
                "'{}' exited with {status}",
                self.program
            ))),
        }
    }
}
