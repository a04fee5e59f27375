//! Error types for fanout-exec

use thiserror::Error;

/// Reason a connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    /// Credentials were rejected
    Auth,
    /// The remote identity did not match what was expected
    HostKey,
    /// Anything else, including timeouts
    Connect,
}

/// Reason a run-as escalation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalateCode {
    /// sudo prompted but no password is configured
    NoPassword,
    /// The connected user may not use sudo
    SudoDenied,
    /// sudo rejected the configured password
    BadPassword,
}

/// Failed step of a remote file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCode {
    Copy,
    Download,
    Write,
    Chmod,
    Mkdir,
    Tempdir,
    Chown,
    Id,
    Mv,
    Filetype,
}

/// Errors that can occur while acting on one target
///
/// A non-zero exit status is not an error; it is reported through
/// [`CommandOutput`](crate::CommandOutput).
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to the target
    #[error("{message}")]
    Connect {
        /// Which part of the connect phase failed
        code: ConnectCode,
        /// Human readable reason
        message: String,
    },

    /// Privilege escalation failed
    #[error("{message}")]
    Escalate {
        /// Which escalation failure occurred
        code: EscalateCode,
        /// Human readable reason
        message: String,
    },

    /// A remote or local file operation failed
    #[error("{message}")]
    File {
        /// Which file step failed
        code: FileCode,
        /// Human readable reason
        message: String,
    },

    /// The command could not be run to completion (no exit status)
    #[error("command execution failed: {0}")]
    Exec(String),

    /// Target or action options are invalid
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The remote shell could not be prepared
    #[error("could not initialize shell: {0}")]
    ShellInit(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// The batch was cancelled while this target was running
    #[error("operation cancelled")]
    Cancelled,
}

impl ExecError {
    /// Authentication failure
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Connect {
            code: ConnectCode::Auth,
            message: message.into(),
        }
    }

    /// Host identity verification failure
    pub fn host_key(message: impl Into<String>) -> Self {
        Self::Connect {
            code: ConnectCode::HostKey,
            message: message.into(),
        }
    }

    /// Generic connect failure or timeout
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            code: ConnectCode::Connect,
            message: message.into(),
        }
    }

    /// Escalation failure
    pub fn escalate(code: EscalateCode, message: impl Into<String>) -> Self {
        Self::Escalate {
            code,
            message: message.into(),
        }
    }

    /// File operation failure
    pub fn file(code: FileCode, message: impl Into<String>) -> Self {
        Self::File {
            code,
            message: message.into(),
        }
    }

    /// Stable issue code, e.g. `AUTH_ERROR`
    #[must_use]
    pub fn issue_code(&self) -> &'static str {
        match self {
            ExecError::Connect { code, .. } => match code {
                ConnectCode::Auth => "AUTH_ERROR",
                ConnectCode::HostKey => "HOST_KEY_ERROR",
                ConnectCode::Connect => "CONNECT_ERROR",
            },
            ExecError::Escalate { code, .. } => match code {
                EscalateCode::NoPassword => "NO_PASSWORD",
                EscalateCode::SudoDenied => "SUDO_DENIED",
                EscalateCode::BadPassword => "BAD_PASSWORD",
            },
            ExecError::File { code, .. } => match code {
                FileCode::Copy => "COPY_ERROR",
                FileCode::Download => "DOWNLOAD_ERROR",
                FileCode::Write => "WRITE_ERROR",
                FileCode::Chmod => "CHMOD_ERROR",
                FileCode::Mkdir => "MKDIR_ERROR",
                FileCode::Tempdir => "TEMPDIR_ERROR",
                FileCode::Chown => "CHOWN_ERROR",
                FileCode::Id => "ID_ERROR",
                FileCode::Mv => "MV_ERROR",
                FileCode::Filetype => "FILETYPE_ERROR",
            },
            ExecError::Exec(_) | ExecError::NotConnected | ExecError::Cancelled => "EXEC_ERROR",
            ExecError::Validation(_) => "VALIDATION_ERROR",
            ExecError::ShellInit(_) => "SHELL_INIT_ERROR",
        }
    }

    /// Error family, e.g. `fanout/connect-error`
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Connect { .. } => "fanout/connect-error",
            ExecError::Escalate { .. } => "fanout/escalate-error",
            ExecError::File { .. } => "fanout/file-error",
            ExecError::Exec(_) | ExecError::NotConnected => "fanout/exec-error",
            ExecError::Cancelled => "fanout/cancelled",
            ExecError::Validation(_) => "fanout/validation-error",
            ExecError::ShellInit(_) => "fanout/shell-error",
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::Connect {
                code: ConnectCode::Connect,
                ..
            } | ExecError::Exec(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_codes() {
        assert_eq!(ExecError::auth("denied").issue_code(), "AUTH_ERROR");
        assert_eq!(ExecError::host_key("bad").issue_code(), "HOST_KEY_ERROR");
        assert_eq!(
            ExecError::escalate(EscalateCode::SudoDenied, "no").issue_code(),
            "SUDO_DENIED"
        );
        assert_eq!(
            ExecError::file(FileCode::Tempdir, "mkdir failed").issue_code(),
            "TEMPDIR_ERROR"
        );
    }

    #[test]
    fn test_kind_and_message() {
        let err = ExecError::connect("timed out after 10s");
        assert_eq!(err.kind(), "fanout/connect-error");
        assert_eq!(err.to_string(), "timed out after 10s");
        assert!(err.is_retryable());
        assert!(!ExecError::auth("denied").is_retryable());
    }
}
