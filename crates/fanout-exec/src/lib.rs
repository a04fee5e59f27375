//! fanout-exec: Transport layer
//!
//! Provides the `Connection` contract and its transports (SSH, WinRM, local,
//! Docker, Podman, LXD), the POSIX and PowerShell command builders, the sudo
//! escalation protocol and remote temporary directories.

pub mod connection;
pub mod driver;
pub mod error;
pub mod keys;
pub mod process;
pub mod result;
pub mod shell;
pub mod sudo;
pub mod target;
pub mod tempdir;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use error::{ConnectCode, EscalateCode, ExecError, FileCode};
pub use process::{Process, ProcessEvent};
pub use result::CommandOutput;
pub use shell::ShellKind;
pub use target::{PrivateKeySource, Target, TargetOptions, TransportKind};
pub use transport::{
    ContainerConnection, ContainerRuntime, LocalConnection, LxdConnection, SshConnection,
    WinrmConnection, remote_basename,
};
