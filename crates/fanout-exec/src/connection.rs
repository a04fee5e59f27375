//! Connection contract shared by every transport

use std::path::Path;

use async_trait::async_trait;

use crate::driver;
use crate::error::ExecError;
use crate::process::Process;
use crate::result::CommandOutput;
use crate::shell::ShellKind;
use crate::target::Target;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

/// A session with exactly one target
///
/// Methods take `&mut self`: a connection is driven by one pipeline at a time
/// and commands on it run sequentially.
#[async_trait]
pub trait Connection: Send {
    /// Target this connection belongs to
    fn target(&self) -> &Target;

    /// User the session is logged in as
    fn user(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Shell family commands must be built for
    fn shell_kind(&self) -> ShellKind {
        if self.target().uses_powershell() {
            ShellKind::PowerShell
        } else {
            ShellKind::Posix
        }
    }

    /// Whether escalated commands must `cd` to the run-as user's home first
    fn reset_cwd(&self) -> bool {
        false
    }

    /// Transport name for logs
    fn transport_name(&self) -> &'static str;

    /// Establish the session
    ///
    /// # Errors
    /// Returns `ExecError::Connect` classified as auth, host key or generic
    /// failure. A failed connection stays `Unconnected`.
    async fn connect(&mut self) -> Result<(), ExecError>;

    /// Start a literal command and stream its output
    ///
    /// # Errors
    /// Returns `ExecError::NotConnected` before `connect`, or
    /// `ExecError::Exec` if the command cannot be started
    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError>;

    /// Copy a local file or directory to `destination`
    ///
    /// A file replaces `destination`; a directory's contents are copied into
    /// `destination`, which is created first.
    ///
    /// # Errors
    /// Returns `ExecError::File` on failure
    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError>;

    /// Copy a remote file or directory into the local directory `destination`
    ///
    /// The copy lands at `destination/<basename of source>`; `destination` is
    /// created first.
    ///
    /// # Errors
    /// Returns `ExecError::File` with `DOWNLOAD_ERROR` on failure
    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError>;

    /// Release the session; calling it again is a no-op
    ///
    /// # Errors
    /// Returns `ExecError::Exec` if the session could not be closed cleanly
    async fn disconnect(&mut self) -> Result<(), ExecError>;

    /// Run a literal command and capture its output
    ///
    /// # Errors
    /// Returns an error if the command could not be run to completion; a
    /// non-zero exit status is returned as a normal `CommandOutput`
    async fn execute(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecError> {
        let process = self.spawn(command, false).await?;
        driver::drive(process, stdin, None).await
    }
}
